//! Vector store trait and the metadata predicates that scope every lookup.
//!
//! One vector index is shared by every chat and tenant. The only isolation is the
//! metadata carried on each row, so queries without at least one predicate are
//! rejected by every implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VectorError;

/// Metadata key holding the owning file identity.
pub const FILE_ID_KEY: &str = "file_id";

/// Metadata key holding the memory session (chat) identity.
pub const SESSION_ID_KEY: &str = "session_id";

/// Metadata key distinguishing what a row is (`chunk`, `table_schema`, `memory`).
pub const KIND_KEY: &str = "kind";

/// Metadata key naming the chat a document row was uploaded to.
pub const CHAT_ID_KEY: &str = "chat_id";

pub const KIND_CHUNK: &str = "chunk";
pub const KIND_TABLE_SCHEMA: &str = "table_schema";
pub const KIND_MEMORY: &str = "memory";

/// An equality constraint on one metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    pub key: String,
    pub value: String,
}

impl Predicate {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Scope to rows owned by one file.
    pub fn file(file_id: impl Into<String>) -> Self {
        Self::eq(FILE_ID_KEY, file_id)
    }

    /// Scope to rows of one chat's memory session.
    pub fn session(chat_id: impl Into<String>) -> Self {
        Self::eq(SESSION_ID_KEY, chat_id)
    }

    pub fn matches(&self, metadata: &serde_json::Map<String, serde_json::Value>) -> bool {
        match metadata.get(&self.key) {
            Some(serde_json::Value::String(s)) => s == &self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

/// True when every predicate matches (conjunction).
pub fn matches_all(predicates: &[Predicate], metadata: &serde_json::Map<String, serde_json::Value>) -> bool {
    predicates.iter().all(|p| p.matches(metadata))
}

/// One stored row: a text chunk, its embedding, and its tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl VectorRecord {
    pub fn new(text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            embedding,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata
            .insert(key.to_string(), serde_json::Value::String(value.into()));
        self
    }

    pub fn file_id(&self) -> Option<&str> {
        self.metadata.get(FILE_ID_KEY).and_then(|v| v.as_str())
    }
}

/// A similarity lookup scoped by predicates.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub embedding: Vec<f32>,
    pub predicates: Vec<Predicate>,
    pub top_k: usize,
    pub min_score: Option<f64>,
}

impl VectorQuery {
    pub fn new(embedding: Vec<f32>, predicates: Vec<Predicate>, top_k: usize) -> Self {
        Self {
            embedding,
            predicates,
            top_k,
            min_score: None,
        }
    }

    /// Reject lookups that would read across the whole shared index.
    pub fn ensure_scoped(&self) -> Result<(), VectorError> {
        if self.predicates.is_empty() {
            Err(VectorError::QueryFailed(
                "refusing unscoped vector query: at least one predicate is required".into(),
            ))
        } else {
            Ok(())
        }
    }
}

/// A query hit with its cosine similarity.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: VectorRecord,
    pub score: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or replace rows by id. Returns how many were written.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize, VectorError>;

    /// Delete every row matching all predicates. Returns how many were removed.
    async fn delete(&self, predicates: &[Predicate]) -> Result<usize, VectorError>;

    /// Top-k rows matching all predicates, best first.
    async fn query(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>, VectorError>;

    /// Count rows matching all predicates.
    async fn count(&self, predicates: &[Predicate]) -> Result<usize, VectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_matches_string_and_scalar_values() {
        let rec = VectorRecord::new("t", vec![]).tag(FILE_ID_KEY, "f1");
        assert!(Predicate::file("f1").matches(&rec.metadata));
        assert!(!Predicate::file("f2").matches(&rec.metadata));
        assert!(!Predicate::session("f1").matches(&rec.metadata));

        let mut meta = serde_json::Map::new();
        meta.insert("n".into(), serde_json::json!(3));
        assert!(Predicate::eq("n", "3").matches(&meta));
    }

    #[test]
    fn conjunction_requires_all() {
        let rec = VectorRecord::new("t", vec![])
            .tag(FILE_ID_KEY, "f1")
            .tag(KIND_KEY, "chunk");
        let both = [Predicate::file("f1"), Predicate::eq(KIND_KEY, "chunk")];
        let wrong = [Predicate::file("f1"), Predicate::eq(KIND_KEY, "memory")];
        assert!(matches_all(&both, &rec.metadata));
        assert!(!matches_all(&wrong, &rec.metadata));
    }

    #[test]
    fn unscoped_query_is_rejected() {
        assert!(VectorQuery::new(vec![1.0], vec![], 3).ensure_scoped().is_err());
        assert!(VectorQuery::new(vec![1.0], vec![Predicate::file("f")], 3).ensure_scoped().is_ok());
    }
}
