//! Test doubles shared by the tool tests.

use async_trait::async_trait;
use docchat_core::error::ProviderError;
use docchat_core::message::Message;
use docchat_core::provider::{
    EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest, ProviderResponse,
};
use std::sync::Mutex;

/// Replies from a script in order, then repeats the last one. Embeds by word hashing.
pub struct ScriptedLlm {
    replies: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        let mut replies: Vec<String> = replies.into_iter().map(String::from).collect();
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 32];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let h = word
            .bytes()
            .fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        v[(h % 32) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Provider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);

        let mut replies = self.replies.lock().unwrap();
        let content = if replies.len() > 1 {
            replies.pop().unwrap_or_default()
        } else {
            replies.last().cloned().unwrap_or_default()
        };
        Ok(ProviderResponse {
            message: Message::assistant(content),
            usage: None,
            model: request.model,
            metadata: serde_json::Map::new(),
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        Ok(EmbeddingResponse {
            embeddings: request.inputs.iter().map(|t| hash_embed(t)).collect(),
            model: request.model,
            usage: None,
        })
    }

    fn supports_embeddings(&self) -> bool {
        true
    }
}
