//! Natural-language questions over one relational dump's own database.

use crate::env::{ToolEnv, strip_fence};
use crate::sql::catalog::{SqlCatalog, read_only_statement};
use async_trait::async_trait;
use docchat_core::chat::{ChatFile, SqlDumpMeta};
use docchat_core::error::ToolError;
use docchat_core::tool::{Tool, ToolResult, text_input, text_input_schema};
use docchat_core::vector::{KIND_KEY, KIND_TABLE_SCHEMA, Predicate, VectorQuery};
use std::sync::Arc;
use tracing::{debug, warn};

const TABLE_TOP_K: usize = 1;
const MAX_ROWS: usize = 50;

const SQL_PROMPT: &str = "You write one read-only SQL query that answers the question. \
Use only the tables and columns given. Output only the SQL, with no explanation.";

pub struct SqlTool {
    name: String,
    description: String,
    file_id: String,
    tables: Vec<String>,
    catalog: Arc<dyn SqlCatalog>,
    env: ToolEnv,
}

impl SqlTool {
    pub fn new(file: &ChatFile, meta: &SqlDumpMeta, catalog: Arc<dyn SqlCatalog>, env: ToolEnv) -> Self {
        let tables_desc = meta.tables.join(", ");
        Self {
            name: format!("sql_tool_{}", meta.database_name),
            description: format!(
                "A SQL Query Engine tool going through the Database '{}'. The table names are {tables_desc}",
                meta.database_name
            ),
            file_id: file.id.clone(),
            tables: meta.tables.clone(),
            catalog,
            env,
        }
    }

    pub fn database_name(&self) -> &str {
        self.catalog.database_name()
    }

    /// Schema text of the table most relevant to the question, searched only
    /// among this file's own table documents.
    async fn relevant_schema(&self, question: &str) -> Result<String, String> {
        let embedding = self.env.embed(question).await.map_err(|e| e.to_string())?;
        let query = VectorQuery::new(
            embedding,
            vec![
                Predicate::file(&self.file_id),
                Predicate::eq(KIND_KEY, KIND_TABLE_SCHEMA),
            ],
            TABLE_TOP_K,
        );
        let hits = self.env.vectors.query(&query).await.map_err(|e| e.to_string())?;
        if let Some(hit) = hits.into_iter().next() {
            return Ok(hit.record.text);
        }

        // Index not populated: describe the tables live.
        let mut parts = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let schema = self.catalog.describe_table(table).await.map_err(|e| e.to_string())?;
            parts.push(schema.render());
        }
        Ok(parts.join("\n"))
    }

    async fn answer(&self, question: &str) -> Result<String, String> {
        let schema = self.relevant_schema(question).await?;
        let prompt = format!(
            "Dialect: {}\nSchema:\n{schema}\n\nQuestion: {question}",
            self.catalog.dialect()
        );
        let reply = self.env.ask(SQL_PROMPT, &prompt).await.map_err(|e| e.to_string())?;
        let sql = read_only_statement(strip_fence(&reply)).map_err(|e| e.to_string())?;
        debug!(tool = %self.name, sql, "Running generated SQL");
        let rows = self.catalog.query(sql, MAX_ROWS).await.map_err(|e| e.to_string())?;
        Ok(format!("SQL: {sql}\n\n{}", rows.to_markdown()))
    }
}

#[async_trait]
impl Tool for SqlTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        text_input_schema("A question answerable from the database tables")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let question = text_input(&arguments)?;
        Ok(match self.answer(&question).await {
            Ok(output) => ToolResult::ok(output),
            Err(e) => {
                warn!(tool = %self.name, error = %e, "SQL tool query failed");
                ToolResult::error(format!("Error: {e}"))
            }
        })
    }
}
