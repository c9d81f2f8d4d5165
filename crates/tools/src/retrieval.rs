//! Vector retrieval over one generic document, scoped by that file's predicate.

use crate::env::{ToolEnv, strip_fence};
use async_trait::async_trait;
use docchat_core::chat::ChatFile;
use docchat_core::error::ToolError;
use docchat_core::tool::{Tool, ToolResult, text_input, text_input_schema};
use docchat_core::vector::{Predicate, VectorQuery};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a file is queried during a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Return the most relevant passages.
    #[default]
    Retrieval,
    /// Distill the relevant passages into JSON fields.
    Extraction,
}

const PLAIN_TEXT_TOP_K: usize = 8;
const DOCUMENT_TOP_K: usize = 4;

const EXTRACTION_PROMPT: &str = "You extract structured data from document excerpts. \
Answer with a single JSON object whose keys name the requested fields and whose values are \
taken verbatim from the excerpts. Use null for anything the excerpts do not state. \
Output only the JSON object.";

pub struct VectorRetrievalTool {
    name: String,
    description: String,
    file_id: String,
    filter: Predicate,
    top_k: usize,
    mode: QueryMode,
    env: ToolEnv,
}

impl VectorRetrievalTool {
    pub fn new(index: usize, file: &ChatFile, filter: Predicate, mode: QueryMode, env: ToolEnv) -> Self {
        let plain = file.is_plain_text();
        let mut description = if plain {
            format!(
                "Reads the text document '{}'. The document is short enough to reason about as a \
                 whole: use it for summaries, overall themes and questions spanning the full text.",
                file.file_name
            )
        } else {
            format!(
                "Searches the document '{}' for passages relevant to a specific question. Ask \
                 focused questions; the tool returns only the best matching passages.",
                file.file_name
            )
        };
        if mode == QueryMode::Extraction {
            description.push_str(
                " The input names the fields to extract; the tool answers with a JSON object.",
            );
        }

        Self {
            name: format!("document_tool_{index}"),
            description,
            file_id: file.id.clone(),
            filter,
            top_k: if plain { PLAIN_TEXT_TOP_K } else { DOCUMENT_TOP_K },
            mode,
            env,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    async fn passages(&self, query: &str) -> Result<Vec<String>, ToolError> {
        let embedding = self.env.embed(query).await.map_err(|e| self.failed(e))?;
        let hits = self
            .env
            .vectors
            .query(&VectorQuery::new(embedding, vec![self.filter.clone()], self.top_k))
            .await
            .map_err(|e| self.failed(e))?;
        debug!(tool = %self.name, file_id = %self.file_id, hits = hits.len(), "Retrieved passages");
        Ok(hits.into_iter().map(|h| h.record.text).collect())
    }

    fn failed(&self, reason: impl std::fmt::Display) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Tool for VectorRetrievalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        match self.mode {
            QueryMode::Retrieval => text_input_schema("The question to look up in the document"),
            QueryMode::Extraction => text_input_schema("The fields to extract, e.g. 'author, date, total amount'"),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = text_input(&arguments)?;
        let passages = self.passages(&query).await?;
        if passages.is_empty() {
            return Ok(ToolResult::ok("No relevant passages found in this document."));
        }

        let joined = passages.join("\n---\n");
        match self.mode {
            QueryMode::Retrieval => Ok(ToolResult::ok(joined)),
            QueryMode::Extraction => {
                let reply = self
                    .env
                    .ask(EXTRACTION_PROMPT, &format!("Fields: {query}\n\nExcerpts:\n{joined}"))
                    .await
                    .map_err(|e| self.failed(e))?;
                let body = strip_fence(&reply);
                match serde_json::from_str::<serde_json::Value>(body) {
                    Ok(value) => Ok(ToolResult::ok(value.to_string()).with_data(value)),
                    Err(_) => Ok(ToolResult::ok(body.to_string())),
                }
            }
        }
    }
}
