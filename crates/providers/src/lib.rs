//! LLM provider implementations for docchat.
//!
//! All providers implement the `docchat_core::Provider` trait. The process
//! builds one provider from configuration at startup and shares it read-only.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use std::sync::Arc;

use docchat_config::LlmConfig;
use docchat_core::{Provider, ProviderError};

/// Build the configured provider.
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider = OpenAiCompatProvider::from_config(config)?;
    tracing::info!(
        provider = provider.name(),
        base_url = provider.base_url(),
        model = %config.resolved_model(),
        embed_model = %config.embed_model,
        "LLM provider ready"
    );
    Ok(Arc::new(provider))
}
