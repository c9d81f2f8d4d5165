//! Ingestion for DocChat: uploads are stored, classified, and turned into
//! filterable content by asynchronous jobs whose outcome is persisted on the file.

pub mod error;
pub mod extract;
pub mod pipeline;

pub use error::IngestError;
pub use extract::extract_text;
pub use pipeline::{Ingestor, avatar_content_type, avatar_extension};
