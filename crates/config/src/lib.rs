//! Configuration loading, validation, and management for docchat.
//!
//! Loads configuration from `~/.docchat/config.toml` with environment
//! variable overrides. Validates all settings at startup. The resolved
//! config is built once and shared read-only for the life of the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.docchat/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM and embedding backend
    #[serde(default)]
    pub llm: LlmConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Layered memory budget
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Document ingestion
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Metadata store, vector store, and dump database servers
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Web scrape / search tools
    #[serde(default)]
    pub web: WebConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which inference backend serves chat and embedding requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    Ollama,
    Ionos,
}

impl std::str::FromStr for LlmProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "ionos" => Ok(Self::Ionos),
            other => Err(ConfigError::ValidationError(format!(
                "unknown LLM provider '{other}' (expected 'ollama' or 'ionos')"
            ))),
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: LlmProviderKind,

    /// Base URL of the OpenAI-compatible endpoint; `None` uses the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Chat model; `None` uses the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

fn default_llm_provider() -> LlmProviderKind {
    LlmProviderKind::Ollama
}
fn default_embed_model() -> String {
    "mxbai-embed-large".into()
}
fn default_request_timeout() -> u64 {
    420
}
fn default_context_window() -> usize {
    128_000
}

pub const OLLAMA_DEFAULT_MODEL: &str = "llama3.1";
pub const IONOS_DEFAULT_MODEL: &str = "meta-llama/Llama-3.3-70B-Instruct";

impl LlmConfig {
    /// The chat model after applying provider defaults.
    pub fn resolved_model(&self) -> String {
        match (&self.model, self.provider) {
            (Some(m), _) if !m.trim().is_empty() => m.clone(),
            (_, LlmProviderKind::Ollama) => OLLAMA_DEFAULT_MODEL.into(),
            (_, LlmProviderKind::Ionos) => IONOS_DEFAULT_MODEL.into(),
        }
    }

    /// The endpoint base URL after applying provider defaults.
    pub fn resolved_base_url(&self) -> String {
        match (&self.base_url, self.provider) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, LlmProviderKind::Ollama) => "http://localhost:11434/v1".into(),
            (None, LlmProviderKind::Ionos) => "https://openai.inference.de-txl.ionos.com/v1".into(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: None,
            api_key: None,
            model: None,
            embed_model: default_embed_model(),
            request_timeout_secs: default_request_timeout(),
            context_window: default_context_window(),
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("embed_model", &self.embed_model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("context_window", &self.context_window)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on reasoning/acting iterations per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Model used when a chat has none set; `None` means the LLM config's model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Directive used when a chat has no context of its own
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_iterations() -> usize {
    50
}
fn default_temperature() -> f32 {
    0.7
}
fn default_system_prompt() -> String {
    "You are a helpful assistant that answers questions about the documents attached to this chat. \
     Use the available tools to look things up before answering, and say so when the documents do not contain the answer."
        .into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            default_model: None,
            default_temperature: default_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total token budget across short-term history and long-term blocks
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,

    /// Share of the budget kept as verbatim short-term history
    #[serde(default = "default_history_ratio")]
    pub chat_history_token_ratio: f64,

    /// Tokens flushed to long-term blocks at a time
    #[serde(default = "default_flush_size")]
    pub token_flush_size: usize,

    #[serde(default = "default_max_facts")]
    pub max_facts: usize,

    /// Past exchanges returned by vector recall
    #[serde(default = "default_similarity_top_k")]
    pub similarity_top_k: usize,

    /// Recent messages folded into the recall query
    #[serde(default = "default_retrieval_window")]
    pub retrieval_context_window: usize,

    /// Most recent stored messages loaded per turn
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_true")]
    pub vector_recall: bool,
}

fn default_token_limit() -> usize {
    128_000
}
fn default_history_ratio() -> f64 {
    0.3
}
fn default_flush_size() -> usize {
    1024
}
fn default_max_facts() -> usize {
    10
}
fn default_similarity_top_k() -> usize {
    3
}
fn default_retrieval_window() -> usize {
    5
}
fn default_history_window() -> usize {
    25
}
fn default_true() -> bool {
    true
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            chat_history_token_ratio: default_history_ratio(),
            token_flush_size: default_flush_size(),
            max_facts: default_max_facts(),
            similarity_top_k: default_similarity_top_k(),
            retrieval_context_window: default_retrieval_window(),
            history_window: default_history_window(),
            vector_recall: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Root directory for uploaded and fetched files
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default = "default_sheet_chunk_size")]
    pub spreadsheet_chunk_size: usize,

    #[serde(default = "default_sheet_chunk_overlap")]
    pub spreadsheet_chunk_overlap: usize,
}

fn default_upload_dir() -> PathBuf {
    AppConfig::config_dir().join("uploads")
}
fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_sheet_chunk_size() -> usize {
    256
}
fn default_sheet_chunk_overlap() -> usize {
    20
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            spreadsheet_chunk_size: default_sheet_chunk_size(),
            spreadsheet_chunk_overlap: default_sheet_chunk_overlap(),
        }
    }
}

/// Coordinates of a database server that hosts per-dump databases.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ServerConfig {
    /// Connection URL for one database on this server.
    pub fn url(&self, scheme: &str, database: &str) -> String {
        match &self.password {
            Some(pw) => format!("{scheme}://{}:{pw}@{}:{}/{database}", self.user, self.host, self.port),
            None => format!("{scheme}://{}@{}:{}/{database}", self.user, self.host, self.port),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL of the chat/file/message store
    #[serde(default = "default_database_url")]
    pub url: String,

    /// SQLite URL of the shared vector index
    #[serde(default = "default_vector_url")]
    pub vector_url: String,

    #[serde(default = "default_postgres")]
    pub postgres: ServerConfig,

    #[serde(default = "default_mysql")]
    pub mysql: ServerConfig,
}

fn default_database_url() -> String {
    format!("sqlite://{}?mode=rwc", AppConfig::config_dir().join("docchat.db").display())
}
fn default_vector_url() -> String {
    format!("sqlite://{}?mode=rwc", AppConfig::config_dir().join("vectors.db").display())
}
fn default_postgres() -> ServerConfig {
    ServerConfig {
        host: "localhost".into(),
        port: 5432,
        user: "root".into(),
        password: None,
    }
}
fn default_mysql() -> ServerConfig {
    ServerConfig {
        host: "localhost".into(),
        port: 3306,
        user: "root".into(),
        password: None,
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            vector_url: default_vector_url(),
            postgres: default_postgres(),
            mysql: default_mysql(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Results fetched and indexed per web search
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Truncate extracted page text beyond this many characters
    #[serde(default = "default_max_fetch_chars")]
    pub max_fetch_chars: usize,
}

fn default_max_search_results() -> usize {
    3
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_max_fetch_chars() -> usize {
    50_000
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            max_search_results: default_max_search_results(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_fetch_chars: default_max_fetch_chars(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted request body (uploads are base64 in JSON)
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    /// HMAC key for session tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_secret: Option<String>,

    /// Accept a plain `X-User-Id` header (local mode)
    #[serde(default)]
    pub allow_header_auth: bool,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8000
}
fn default_max_body() -> usize {
    64 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body(),
            session_secret: None,
            allow_header_auth: false,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("session_secret", &redact(&self.session_secret))
            .field("allow_header_auth", &self.allow_header_auth)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from the default path (~/.docchat/config.toml),
    /// then apply environment overrides from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (highest priority).
    ///
    /// Recognized keys: `LLM_PROVIDER`, `OLLAMA_MODEL`, `OLLAMA_BASE_URL`,
    /// `IONOS_API_KEY`, `EMBED_MODEL`, `PG_*`, `MYSQL_*`,
    /// `DOCCHAT_DATABASE_URL`, `DOCCHAT_SESSION_SECRET`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        match self.llm.provider {
            LlmProviderKind::Ollama => {
                if let Some(model) = lookup("OLLAMA_MODEL") {
                    self.llm.model = Some(model);
                }
                if let Some(url) = lookup("OLLAMA_BASE_URL") {
                    self.llm.base_url = Some(url);
                }
            }
            LlmProviderKind::Ionos => {
                if let Some(key) = lookup("IONOS_API_KEY") {
                    self.llm.api_key = Some(key);
                }
            }
        }
        if let Some(embed) = lookup("EMBED_MODEL") {
            self.llm.embed_model = embed;
        }

        apply_server_env(&mut self.database.postgres, "PG", &lookup)?;
        apply_server_env(&mut self.database.mysql, "MYSQL", &lookup)?;

        if let Some(url) = lookup("DOCCHAT_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(secret) = lookup("DOCCHAT_SESSION_SECRET") {
            self.gateway.session_secret = Some(secret);
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".docchat")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.memory.chat_history_token_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(ConfigError::ValidationError(
                "memory.chat_history_token_ratio must be between 0 and 1 (exclusive)".into(),
            ));
        }

        if self.memory.token_limit == 0 {
            return Err(ConfigError::ValidationError("memory.token_limit must be > 0".into()));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError("agent.max_iterations must be > 0".into()));
        }

        if !(0.0..=2.0).contains(&self.agent.default_temperature) {
            return Err(ConfigError::ValidationError(
                "agent.default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.ingest.chunk_overlap >= self.ingest.chunk_size
            || self.ingest.spreadsheet_chunk_overlap >= self.ingest.spreadsheet_chunk_size
        {
            return Err(ConfigError::ValidationError(
                "ingest chunk overlap must be smaller than the chunk size".into(),
            ));
        }

        if self.llm.provider == LlmProviderKind::Ionos && self.llm.api_key.is_none() {
            return Err(ConfigError::ValidationError(
                "llm.api_key (or IONOS_API_KEY) is required for the ionos provider".into(),
            ));
        }

        Ok(())
    }

    /// The model a chat without its own selector runs on.
    pub fn default_chat_model(&self) -> String {
        self.agent
            .default_model
            .clone()
            .unwrap_or_else(|| self.llm.resolved_model())
    }

    /// Generate a default config TOML string (for `config show`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn apply_server_env(
    server: &mut ServerConfig,
    prefix: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = lookup(&format!("{prefix}_HOST")) {
        server.host = host;
    }
    if let Some(port) = lookup(&format!("{prefix}_PORT")) {
        server.port = port.parse().map_err(|_| {
            ConfigError::ValidationError(format!("{prefix}_PORT is not a valid port: '{port}'"))
        })?;
    }
    if let Some(user) = lookup(&format!("{prefix}_USER")) {
        server.user = user;
    }
    if let Some(password) = lookup(&format!("{prefix}_PASSWORD")) {
        server.password = Some(password);
    }
    Ok(())
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
