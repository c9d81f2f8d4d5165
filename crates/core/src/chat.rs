//! Chat domain entities: chats, attached files, stored messages, favourites.
//!
//! These are the records persisted by a [`RelationalStore`](crate::store::RelationalStore).
//! A chat owns its files and messages exclusively; deleting a chat cascades to both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Message, Role};

/// A conversation thread owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,

    /// Free-text system prompt for this chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Model selector; `None` falls back to the configured default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_path: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction_at: Option<DateTime<Utc>>,
}

impl Chat {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            context: None,
            temperature: None,
            model: None,
            avatar_path: None,
            created_at: now,
            updated_at: now,
            last_interaction_at: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Record a completed turn.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_interaction_at = Some(at);
        self.updated_at = at;
    }

    /// Fail with `Forbidden` unless `user_id` owns this chat.
    pub fn ensure_owner(&self, user_id: &str) -> Result<(), StoreError> {
        if self.user_id == user_id {
            Ok(())
        } else {
            Err(StoreError::Forbidden {
                entity: "chat",
                id: self.id.clone(),
            })
        }
    }

    pub fn apply(&mut self, update: ChatUpdate) {
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(context) = update.context {
            self.context = Some(context);
        }
        if let Some(temperature) = update.temperature {
            self.temperature = Some(temperature);
        }
        if let Some(model) = update.model {
            self.model = Some(model);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial chat update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Closed content classification of an attachment, resolved once at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    GenericDocument,
    Spreadsheet,
    RelationalDump,
    WebArtifact,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::GenericDocument => "generic_document",
            FileKind::Spreadsheet => "spreadsheet",
            FileKind::RelationalDump => "relational_dump",
            FileKind::WebArtifact => "web_artifact",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "spreadsheet" => FileKind::Spreadsheet,
            "relational_dump" => FileKind::RelationalDump,
            "web_artifact" => FileKind::WebArtifact,
            _ => FileKind::GenericDocument,
        }
    }

    /// Classify an upload from its declared MIME type, falling back to the extension.
    pub fn from_mime(mime_type: &str, file_name: &str) -> Self {
        let mime = mime_type.to_ascii_lowercase();
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();

        if mime.contains("sql") || ext == "sql" {
            FileKind::RelationalDump
        } else if mime.contains("csv")
            || mime.contains("excel")
            || mime.contains("spreadsheetml")
            || matches!(ext.as_str(), "csv" | "xls" | "xlsx")
        {
            FileKind::Spreadsheet
        } else {
            FileKind::GenericDocument
        }
    }
}

/// Tri-state indexing flag plus a failure state for ingestion jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    NotApplicable,
    Pending,
    Done,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::NotApplicable => "not_applicable",
            IndexStatus::Pending => "pending",
            IndexStatus::Done => "done",
            IndexStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => IndexStatus::Pending,
            "done" => IndexStatus::Done,
            "failed" => IndexStatus::Failed,
            _ => IndexStatus::NotApplicable,
        }
    }
}

/// SQL engine a relational dump was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlDialect {
    MySql,
    Postgres,
    Unknown,
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SqlDialect::MySql => "MySQL",
            SqlDialect::Postgres => "Postgres",
            SqlDialect::Unknown => "Unknown",
        })
    }
}

impl std::str::FromStr for SqlDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(SqlDialect::MySql),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "unknown" => Ok(SqlDialect::Unknown),
            other => Err(format!("unknown SQL dialect '{other}'")),
        }
    }
}

/// Metadata of a relational dump materialized into its own database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlDumpMeta {
    pub database_name: String,
    pub dialect: SqlDialect,
    #[serde(default)]
    pub tables: Vec<String>,
}

/// An ingested artifact attached to exactly one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFile {
    pub id: String,
    pub chat_id: String,
    pub file_name: String,
    /// Where the raw bytes live on disk.
    pub path_name: String,
    pub mime_type: String,
    pub kind: FileKind,
    pub index_status: IndexStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<SqlDumpMeta>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatFile {
    /// A freshly uploaded file, pending ingestion.
    pub fn new(
        chat_id: impl Into<String>,
        file_name: impl Into<String>,
        path_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_type.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            kind: FileKind::from_mime(&mime_type, &file_name),
            file_name,
            path_name: path_name.into(),
            mime_type,
            index_status: IndexStatus::Pending,
            index_error: None,
            source_url: None,
            sql: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A file created from fetched web content.
    pub fn web_artifact(
        chat_id: impl Into<String>,
        url: impl Into<String>,
        path_name: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let mut file = Self::new(chat_id, url.clone(), path_name, "text/html");
        file.kind = FileKind::WebArtifact;
        file.source_url = Some(url);
        file
    }

    /// Plain text and markdown are small enough to reason over as a whole.
    pub fn is_plain_text(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        let name = self.file_name.to_ascii_lowercase();
        mime.starts_with("text/plain")
            || mime.contains("markdown")
            || name.ends_with(".md")
            || name.ends_with(".txt")
    }

    pub fn mark_indexed(&mut self) {
        self.index_status = IndexStatus::Done;
        self.index_error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.index_status = IndexStatus::Failed;
        self.index_error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

/// Block-type discriminator for plain text messages.
pub const TEXT_BLOCK: &str = "text";

/// One immutable turn entry in a chat's durable message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub text: String,
    pub block_type: String,
    #[serde(default)]
    pub additional_kwargs: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(chat_id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            role,
            text: text.into(),
            block_type: TEXT_BLOCK.to_string(),
            additional_kwargs: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(chat_id, Role::User, text)
    }

    pub fn assistant(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(chat_id, Role::Assistant, text)
    }

    /// Convert to the uniform role/content/metadata shape the model sees.
    pub fn to_llm_message(&self) -> Message {
        let mut msg = match self.role {
            Role::Assistant => Message::assistant(self.text.clone()),
            Role::System => Message::system(self.text.clone()),
            _ => Message::user(self.text.clone()),
        };
        msg.id = self.id.clone();
        msg.timestamp = self.created_at;
        msg.metadata = self.additional_kwargs.clone();
        msg
    }
}

/// A user's bookmark on a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favourite {
    pub id: String,
    pub user_id: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
}

impl Favourite {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}
