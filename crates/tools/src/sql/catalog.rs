//! Relational dump databases: provisioning, loading, and read-only querying.
//!
//! Every dump lives in its own database on the server for its dialect. The
//! [`SqlServers`] trait owns the lifecycle; a [`SqlCatalog`] is a handle on one
//! such database, used by the SQL tool.

use crate::sql::dump::{DumpStatement, is_safe_identifier};
use async_trait::async_trait;
use docchat_config::ServerConfig;
use docchat_core::chat::SqlDialect;
use docchat_core::error::ToolError;
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Column, Connection, Executor, Row};
use std::sync::Arc;
use futures::TryStreamExt;
use tracing::{debug, info, warn};

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumn {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<TableColumn>,
}

impl TableSchema {
    /// The text indexed for table retrieval and shown to the SQL writer.
    pub fn render(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        format!("Table '{}' with columns: {cols}", self.name)
    }
}

/// Result rows rendered as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryRows {
    pub fn to_markdown(&self) -> String {
        if self.rows.is_empty() {
            return "(no rows)".to_string();
        }
        let mut out = format!("| {} |\n|{}\n", self.columns.join(" | "), " --- |".repeat(self.columns.len()));
        for row in &self.rows {
            out.push_str(&format!("| {} |\n", row.join(" | ")));
        }
        out
    }
}

/// A handle on one dump database.
#[async_trait]
pub trait SqlCatalog: Send + Sync {
    fn database_name(&self) -> &str;

    fn dialect(&self) -> SqlDialect;

    async fn list_tables(&self) -> Result<Vec<String>, ToolError>;

    async fn describe_table(&self, table: &str) -> Result<TableSchema, ToolError>;

    /// Run one read-only statement, returning at most `max_rows` rows.
    async fn query(&self, sql: &str, max_rows: usize) -> Result<QueryRows, ToolError>;
}

/// Lifecycle of dump databases on the configured servers.
#[async_trait]
pub trait SqlServers: Send + Sync {
    /// Create the database if it does not exist.
    async fn provision(&self, dialect: SqlDialect, database: &str) -> Result<(), ToolError>;

    /// Execute dump statements in order on one connection. Returns the number executed.
    async fn load(
        &self,
        dialect: SqlDialect,
        database: &str,
        statements: &[DumpStatement],
    ) -> Result<usize, ToolError>;

    async fn drop_database(&self, dialect: SqlDialect, database: &str) -> Result<(), ToolError>;

    async fn open(&self, dialect: SqlDialect, database: &str) -> Result<Arc<dyn SqlCatalog>, ToolError>;
}

fn sql_err(context: &str, e: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: "sql".into(),
        reason: format!("{context}: {e}"),
    }
}

fn check_name(database: &str) -> Result<(), ToolError> {
    if is_safe_identifier(database) {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(format!("unsafe database name '{database}'")))
    }
}

fn unsupported(dialect: SqlDialect) -> ToolError {
    ToolError::InvalidArguments(format!("no server configured for {dialect} dumps"))
}

/// Accept a single read-only statement; returns it without a trailing semicolon.
pub fn read_only_statement(sql: &str) -> Result<&str, ToolError> {
    let statement = sql.trim().trim_end_matches(';').trim();
    if statement.contains(';') {
        return Err(ToolError::InvalidArguments("only one statement may be run".into()));
    }
    let first = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    match first.as_str() {
        "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" => Ok(statement),
        _ => Err(ToolError::InvalidArguments(format!(
            "only read-only queries are allowed, got '{first}'"
        ))),
    }
}

/// Cap a query at `max_rows` on the server. Statements that cannot be nested
/// (`SHOW`, `EXPLAIN`, ...) are returned unchanged.
pub fn limited_statement(statement: &str, max_rows: usize) -> String {
    let first = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    match first.as_str() {
        "SELECT" | "WITH" => format!("SELECT * FROM ({statement}) AS q LIMIT {max_rows}"),
        _ => statement.to_string(),
    }
}

/// Dump databases on real Postgres and MySQL servers.
#[derive(Debug, Clone)]
pub struct SqlxServers {
    postgres: ServerConfig,
    mysql: ServerConfig,
}

impl SqlxServers {
    pub fn new(postgres: ServerConfig, mysql: ServerConfig) -> Self {
        Self { postgres, mysql }
    }
}

#[async_trait]
impl SqlServers for SqlxServers {
    async fn provision(&self, dialect: SqlDialect, database: &str) -> Result<(), ToolError> {
        check_name(database)?;
        match dialect {
            SqlDialect::Postgres => {
                let mut conn = PgConnection::connect(&self.postgres.url("postgres", "postgres"))
                    .await
                    .map_err(|e| sql_err("connect postgres", e))?;
                let exists = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
                    .bind(database)
                    .fetch_optional(&mut conn)
                    .await
                    .map_err(|e| sql_err("check database", e))?;
                if exists.is_none() {
                    (&mut conn)
                        .execute(sqlx::raw_sql(&format!("CREATE DATABASE \"{database}\"")))
                        .await
                        .map_err(|e| sql_err("create database", e))?;
                }
            }
            SqlDialect::MySql => {
                let mut conn = MySqlConnection::connect(&self.mysql.url("mysql", ""))
                    .await
                    .map_err(|e| sql_err("connect mysql", e))?;
                (&mut conn)
                    .execute(sqlx::raw_sql(&format!("CREATE DATABASE IF NOT EXISTS `{database}`")))
                    .await
                    .map_err(|e| sql_err("create database", e))?;
            }
            SqlDialect::Unknown => return Err(unsupported(dialect)),
        }
        info!(database, %dialect, "Dump database provisioned");
        Ok(())
    }

    async fn load(
        &self,
        dialect: SqlDialect,
        database: &str,
        statements: &[DumpStatement],
    ) -> Result<usize, ToolError> {
        check_name(database)?;
        match dialect {
            SqlDialect::Postgres => {
                let mut conn = PgConnection::connect(&self.postgres.url("postgres", database))
                    .await
                    .map_err(|e| sql_err("connect postgres", e))?;
                for (i, statement) in statements.iter().enumerate() {
                    let context = format!("statement {}", i + 1);
                    match statement {
                        DumpStatement::Sql(sql) => {
                            (&mut conn)
                                .execute(sqlx::raw_sql(sql))
                                .await
                                .map_err(|e| sql_err(&context, e))?;
                        }
                        DumpStatement::CopyFromStdin { command, data } => {
                            let mut copy = conn.copy_in_raw(command).await.map_err(|e| sql_err(&context, e))?;
                            copy.send(data.as_bytes()).await.map_err(|e| sql_err(&context, e))?;
                            let rows = copy.finish().await.map_err(|e| sql_err(&context, e))?;
                            debug!(database, rows, "COPY block loaded");
                        }
                    }
                }
            }
            SqlDialect::MySql => {
                let mut conn = MySqlConnection::connect(&self.mysql.url("mysql", database))
                    .await
                    .map_err(|e| sql_err("connect mysql", e))?;
                for (i, statement) in statements.iter().enumerate() {
                    match statement {
                        DumpStatement::Sql(sql) => {
                            (&mut conn)
                                .execute(sqlx::raw_sql(sql))
                                .await
                                .map_err(|e| sql_err(&format!("statement {}", i + 1), e))?;
                        }
                        DumpStatement::CopyFromStdin { command, .. } => {
                            warn!(database, command = %command, "COPY FROM stdin in a MySQL dump; skipped");
                        }
                    }
                }
            }
            SqlDialect::Unknown => return Err(unsupported(dialect)),
        }
        debug!(database, statements = statements.len(), "Dump loaded");
        Ok(statements.len())
    }

    async fn drop_database(&self, dialect: SqlDialect, database: &str) -> Result<(), ToolError> {
        check_name(database)?;
        match dialect {
            SqlDialect::Postgres => {
                let mut conn = PgConnection::connect(&self.postgres.url("postgres", "postgres"))
                    .await
                    .map_err(|e| sql_err("connect postgres", e))?;
                (&mut conn)
                    .execute(sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS \"{database}\" WITH (FORCE)")))
                    .await
                    .map_err(|e| sql_err("drop database", e))?;
            }
            SqlDialect::MySql => {
                let mut conn = MySqlConnection::connect(&self.mysql.url("mysql", ""))
                    .await
                    .map_err(|e| sql_err("connect mysql", e))?;
                (&mut conn)
                    .execute(sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS `{database}`")))
                    .await
                    .map_err(|e| sql_err("drop database", e))?;
            }
            SqlDialect::Unknown => return Err(unsupported(dialect)),
        }
        info!(database, %dialect, "Dump database dropped");
        Ok(())
    }

    async fn open(&self, dialect: SqlDialect, database: &str) -> Result<Arc<dyn SqlCatalog>, ToolError> {
        check_name(database)?;
        let catalog: Arc<dyn SqlCatalog> = match dialect {
            SqlDialect::Postgres => Arc::new(PgCatalog {
                pool: PgPoolOptions::new()
                    .max_connections(2)
                    .connect(&self.postgres.url("postgres", database))
                    .await
                    .map_err(|e| sql_err("connect postgres", e))?,
                database: database.to_string(),
            }),
            SqlDialect::MySql => Arc::new(MySqlCatalog {
                pool: MySqlPoolOptions::new()
                    .max_connections(2)
                    .connect(&self.mysql.url("mysql", database))
                    .await
                    .map_err(|e| sql_err("connect mysql", e))?,
                database: database.to_string(),
            }),
            SqlDialect::Unknown => return Err(unsupported(dialect)),
        };
        Ok(catalog)
    }
}

struct PgCatalog {
    pool: PgPool,
    database: String,
}

#[async_trait]
impl SqlCatalog for PgCatalog {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn list_tables(&self) -> Result<Vec<String>, ToolError> {
        sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sql_err("list tables", e))
    }

    async fn describe_table(&self, table: &str) -> Result<TableSchema, ToolError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sql_err("describe table", e))?;
        Ok(TableSchema {
            name: table.to_string(),
            columns: rows
                .into_iter()
                .map(|(name, data_type)| TableColumn { name, data_type })
                .collect(),
        })
    }

    async fn query(&self, sql: &str, max_rows: usize) -> Result<QueryRows, ToolError> {
        let statement = read_only_statement(sql)?;
        let described = (&self.pool)
            .describe(statement)
            .await
            .map_err(|e| sql_err("prepare", e))?;
        let columns: Vec<String> = described.columns().iter().map(|c| c.name().to_string()).collect();

        // row_to_json renders every Postgres type, numeric included, as text.
        let wrapped = format!("SELECT row_to_json(q)::text FROM ({statement}) AS q LIMIT {max_rows}");
        let json_rows: Vec<String> = sqlx::query_scalar(&wrapped)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_err("query", e))?;

        let mut rows = Vec::with_capacity(json_rows.len());
        for raw in json_rows {
            let object: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&raw).map_err(|e| sql_err("decode row", e))?;
            rows.push(
                columns
                    .iter()
                    .map(|c| match object.get(c) {
                        None | Some(serde_json::Value::Null) => "NULL".to_string(),
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                    })
                    .collect(),
            );
        }
        Ok(QueryRows { columns, rows })
    }
}

struct MySqlCatalog {
    pool: MySqlPool,
    database: String,
}

/// First decoding that succeeds wins; NULL renders as `NULL`.
macro_rules! cell_text {
    ($row:expr, $idx:expr, $($ty:ty),+ $(,)?) => {{
        let mut out: Option<String> = None;
        $(
            if out.is_none() {
                if let Ok(v) = $row.try_get::<Option<$ty>, _>($idx) {
                    out = Some(v.map(|v| v.to_string()).unwrap_or_else(|| "NULL".to_string()));
                }
            }
        )+
        out.unwrap_or_else(|| "?".to_string())
    }};
}

#[async_trait]
impl SqlCatalog for MySqlCatalog {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::MySql
    }

    async fn list_tables(&self) -> Result<Vec<String>, ToolError> {
        sqlx::query_scalar(
            "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
             WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(&self.database)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sql_err("list tables", e))
    }

    async fn describe_table(&self, table: &str) -> Result<TableSchema, ToolError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT CAST(column_name AS CHAR), CAST(column_type AS CHAR) FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
        )
        .bind(&self.database)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sql_err("describe table", e))?;
        Ok(TableSchema {
            name: table.to_string(),
            columns: rows
                .into_iter()
                .map(|(name, data_type)| TableColumn { name, data_type })
                .collect(),
        })
    }

    async fn query(&self, sql: &str, max_rows: usize) -> Result<QueryRows, ToolError> {
        let statement = limited_statement(read_only_statement(sql)?, max_rows);
        let mut stream = sqlx::raw_sql(&statement).fetch(&self.pool);
        let mut fetched = Vec::new();
        while fetched.len() < max_rows {
            match stream.try_next().await.map_err(|e| sql_err("query", e))? {
                Some(row) => fetched.push(row),
                None => break,
            }
        }
        drop(stream);

        let columns = fetched
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = fetched
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| {
                        cell_text!(
                            row,
                            i,
                            String,
                            i64,
                            u64,
                            sqlx::types::Decimal,
                            f64,
                            bool,
                            chrono::NaiveDate,
                            chrono::NaiveDateTime,
                            chrono::DateTime<chrono::Utc>,
                        )
                    })
                    .collect()
            })
            .collect();
        Ok(QueryRows { columns, rows })
    }
}
