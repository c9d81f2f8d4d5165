//! Relational store backends for DocChat.
//!
//! - [`InMemoryStore`]: process-local tables, used by tests and the CLI `ask` command
//! - [`SqliteStore`]: durable store on SQLite via sqlx

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
