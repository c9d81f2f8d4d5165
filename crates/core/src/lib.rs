//! # docchat Core
//!
//! Domain types, capability traits, and error definitions for the docchat
//! document-chat backend. This crate has no framework dependencies: it defines
//! the model every other crate implements against.
//!
//! ## Capabilities
//!
//! Every external collaborator is a trait here, with implementations in their own crates:
//! - [`Provider`]: LLM completion, streaming and embeddings
//! - [`RelationalStore`]: chats, files, messages and favourites
//! - [`VectorStore`]: predicate-scoped similarity search
//! - [`WebFetcher`] / [`WebSearcher`]: web access for the web tools
//! - [`UserResolver`]: request credentials to user id

pub mod auth;
pub mod chat;
pub mod error;
pub mod message;
pub mod provider;
pub mod store;
pub mod tool;
pub mod vector;
pub mod web;

// Re-export key types at crate root for ergonomics
pub use auth::{Credentials, UserResolver};
pub use chat::{Chat, ChatFile, ChatMessage, ChatUpdate, Favourite, FileKind, IndexStatus, Page, SqlDialect, SqlDumpMeta};
pub use error::{AuthError, Error, ProviderError, Result, StoreError, ToolError, VectorError};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage};
pub use store::{RelationalStore, StoreResult, StoreSession};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
pub use vector::{Predicate, ScoredRecord, VectorQuery, VectorRecord, VectorStore};
pub use web::{FetchedPage, SearchHit, WebFetcher, WebSearcher};
