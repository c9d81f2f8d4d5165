//! In-memory vector store, for tests and ephemeral sessions.

use crate::vector::rank_records;
use async_trait::async_trait;
use docchat_core::error::VectorError;
use docchat_core::vector::{Predicate, ScoredRecord, VectorQuery, VectorRecord, VectorStore, matches_all};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A vector store that keeps every record in a Vec and scans on query.
#[derive(Clone)]
pub struct InMemoryVectorStore {
    records: Arc<RwLock<Vec<VectorRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Total number of records regardless of tags.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize, VectorError> {
        let n = records.len();
        let mut all = self.records.write().await;
        for record in records {
            match all.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => all.push(record),
            }
        }
        Ok(n)
    }

    async fn delete(&self, predicates: &[Predicate]) -> Result<usize, VectorError> {
        if predicates.is_empty() {
            return Err(VectorError::Storage("refusing unscoped delete".into()));
        }
        let mut all = self.records.write().await;
        let before = all.len();
        all.retain(|r| !matches_all(predicates, &r.metadata));
        Ok(before - all.len())
    }

    async fn query(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>, VectorError> {
        let all = self.records.read().await;
        rank_records(all.iter(), query)
    }

    async fn count(&self, predicates: &[Predicate]) -> Result<usize, VectorError> {
        let all = self.records.read().await;
        Ok(all.iter().filter(|r| matches_all(predicates, &r.metadata)).count())
    }
}
