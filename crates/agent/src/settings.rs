//! Per-turn settings resolved from the chat, falling back to configuration.

use crate::orchestrator::AgentOptions;
use docchat_config::AppConfig;
use docchat_core::chat::Chat;

#[derive(Debug, Clone, PartialEq)]
pub struct TurnSettings {
    pub system_prompt: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_iterations: usize,
}

impl TurnSettings {
    pub fn resolve(chat: &Chat, config: &AppConfig) -> Self {
        let system_prompt = chat
            .context
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| config.agent.system_prompt.clone());
        let model = chat
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| config.default_chat_model());

        Self {
            system_prompt,
            model,
            temperature: chat.temperature.unwrap_or(config.agent.default_temperature),
            timeout_secs: config.llm.request_timeout_secs,
            max_iterations: config.agent.max_iterations,
        }
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            timeout_secs: Some(self.timeout_secs),
            max_iterations: self.max_iterations,
        }
    }
}
