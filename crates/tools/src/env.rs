//! Shared handles every per-turn tool binding closes over.

use docchat_core::message::Message;
use docchat_core::provider::{Provider, ProviderRequest};
use docchat_core::error::ProviderError;
use docchat_core::vector::VectorStore;
use docchat_memory::embed_query;
use std::sync::Arc;

/// LLM, embedding model and vector index resolved for one turn.
#[derive(Clone)]
pub struct ToolEnv {
    pub llm: Arc<dyn Provider>,
    /// Model used for the tools' own helper prompts (query planning, SQL writing).
    pub model: String,
    pub embed_model: String,
    pub vectors: Arc<dyn VectorStore>,
}

impl ToolEnv {
    pub fn new(
        llm: Arc<dyn Provider>,
        model: impl Into<String>,
        embed_model: impl Into<String>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            embed_model: embed_model.into(),
            vectors,
        }
    }

    /// One deterministic system+user exchange; returns the reply text.
    pub async fn ask(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let request = ProviderRequest::simple(
            self.model.clone(),
            vec![Message::system(system), Message::user(user)],
            0.0,
        );
        let response = self.llm.complete(request).await?;
        Ok(response.message.content)
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        embed_query(self.llm.as_ref(), &self.embed_model, text).await
    }
}

/// Strip a surrounding markdown code fence, if any.
pub(crate) fn strip_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}
