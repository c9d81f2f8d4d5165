//! Document indexer: chunk, embed, and upsert rows tagged with their owning file.
//!
//! Row ids are derived from the file id and chunk position, so re-indexing a file
//! overwrites its rows instead of duplicating them.

use crate::chunk::TextChunker;
use docchat_core::chat::ChatFile;
use docchat_core::error::{ProviderError, Result, VectorError};
use docchat_core::provider::{EmbeddingRequest, Provider};
use docchat_core::vector::{
    CHAT_ID_KEY, FILE_ID_KEY, KIND_CHUNK, KIND_KEY, Predicate, VectorRecord, VectorStore,
};
use std::sync::Arc;
use tracing::{debug, info};

const EMBED_BATCH: usize = 32;

/// Embed `texts` with `model`, batching requests. Output order matches input order.
pub async fn embed_texts(
    provider: &dyn Provider,
    model: &str,
    texts: &[String],
) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBED_BATCH) {
        let response = provider
            .embed(EmbeddingRequest {
                model: model.to_string(),
                inputs: batch.to_vec(),
            })
            .await?;
        if response.embeddings.len() != batch.len() {
            return Err(ProviderError::ApiError {
                status_code: 200,
                message: format!(
                    "embedding count mismatch: sent {}, got {}",
                    batch.len(),
                    response.embeddings.len()
                ),
            });
        }
        out.extend(response.embeddings);
    }
    Ok(out)
}

/// Embed a single query string.
pub async fn embed_query(
    provider: &dyn Provider,
    model: &str,
    text: &str,
) -> std::result::Result<Vec<f32>, ProviderError> {
    let mut vectors = embed_texts(provider, model, &[text.to_string()]).await?;
    vectors.pop().ok_or_else(|| ProviderError::ApiError {
        status_code: 200,
        message: "empty embedding response".into(),
    })
}

pub struct DocumentIndexer {
    provider: Arc<dyn Provider>,
    store: Arc<dyn VectorStore>,
    embed_model: String,
}

impl DocumentIndexer {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn VectorStore>, embed_model: impl Into<String>) -> Self {
        Self {
            provider,
            store,
            embed_model: embed_model.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn embed_model(&self) -> &str {
        &self.embed_model
    }

    /// Chunk `text` and index every chunk under `file`. Returns the number of rows written.
    pub async fn index_text(&self, file: &ChatFile, text: &str, chunker: &TextChunker) -> Result<usize> {
        let chunks: Vec<String> = chunker.chunk(text).into_iter().map(|c| c.text).collect();
        self.index_documents(file, KIND_CHUNK, chunks).await
    }

    /// Index pre-built documents (one row each) under `file` with the given kind tag.
    pub async fn index_documents(&self, file: &ChatFile, kind: &str, documents: Vec<String>) -> Result<usize> {
        if documents.is_empty() {
            debug!(file_id = %file.id, "Nothing to index");
            return Ok(0);
        }

        let embeddings = embed_texts(self.provider.as_ref(), &self.embed_model, &documents).await?;
        let records: Vec<VectorRecord> = documents
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| {
                let mut record = VectorRecord::new(text, embedding)
                    .tag(FILE_ID_KEY, &file.id)
                    .tag(CHAT_ID_KEY, &file.chat_id)
                    .tag(KIND_KEY, kind)
                    .tag("file_name", &file.file_name);
                record.id = format!("{}:{kind}:{i}", file.id);
                record
            })
            .collect();

        let n = self.store.upsert(records).await?;
        info!(file_id = %file.id, kind, rows = n, "Indexed file");
        Ok(n)
    }

    /// Remove every row owned by `file_id`.
    pub async fn delete_file_index(&self, file_id: &str) -> std::result::Result<usize, VectorError> {
        let n = self.store.delete(&[Predicate::file(file_id)]).await?;
        debug!(file_id, rows = n, "Deleted file index");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryVectorStore;
    use async_trait::async_trait;
    use docchat_core::provider::{EmbeddingResponse, ProviderRequest, ProviderResponse};
    use docchat_core::vector::VectorQuery;

    struct LengthEmbedder;

    #[async_trait]
    impl Provider for LengthEmbedder {
        fn name(&self) -> &str {
            "length"
        }

        async fn complete(&self, _r: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("no chat".into()))
        }

        async fn embed(&self, r: EmbeddingRequest) -> std::result::Result<EmbeddingResponse, ProviderError> {
            Ok(EmbeddingResponse {
                embeddings: r.inputs.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                model: r.model,
                usage: None,
            })
        }

        fn supports_embeddings(&self) -> bool {
            true
        }
    }

    fn indexer() -> (DocumentIndexer, Arc<InMemoryVectorStore>) {
        let store = Arc::new(InMemoryVectorStore::new());
        let indexer = DocumentIndexer::new(Arc::new(LengthEmbedder), store.clone(), "embed");
        (indexer, store)
    }

    #[tokio::test]
    async fn indexes_chunks_tagged_with_file() {
        let (indexer, store) = indexer();
        let file = ChatFile::new("chat-1", "a.txt", "/tmp/a.txt", "text/plain");
        let text = "Sentence one. ".repeat(100);
        let n = indexer
            .index_text(&file, &text, &TextChunker::new(32, 4))
            .await
            .unwrap();
        assert!(n > 1);
        assert_eq!(store.count(&[Predicate::file(&file.id)]).await.unwrap(), n);

        let hits = store
            .query(&VectorQuery::new(vec![1.0, 1.0], vec![Predicate::file(&file.id)], 1))
            .await
            .unwrap();
        assert_eq!(hits[0].record.metadata[CHAT_ID_KEY], "chat-1");
        assert_eq!(hits[0].record.metadata[KIND_KEY], KIND_CHUNK);
    }

    #[tokio::test]
    async fn reindex_does_not_duplicate() {
        let (indexer, store) = indexer();
        let file = ChatFile::new("chat-1", "a.txt", "/tmp/a.txt", "text/plain");
        let chunker = TextChunker::new(1024, 100);
        indexer.index_text(&file, "same text", &chunker).await.unwrap();
        indexer.index_text(&file, "same text", &chunker).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn delete_only_removes_owned_rows() {
        let (indexer, store) = indexer();
        let a = ChatFile::new("c", "a.txt", "/tmp/a", "text/plain");
        let b = ChatFile::new("c", "b.txt", "/tmp/b", "text/plain");
        let chunker = TextChunker::new(1024, 100);
        indexer.index_text(&a, "alpha", &chunker).await.unwrap();
        indexer.index_text(&b, "beta", &chunker).await.unwrap();

        assert_eq!(indexer.delete_file_index(&a.id).await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.count(&[Predicate::file(&b.id)]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_text_indexes_nothing() {
        let (indexer, _store) = indexer();
        let file = ChatFile::new("c", "a.txt", "/tmp/a", "text/plain");
        let n = indexer
            .index_text(&file, "   ", &TextChunker::new(1024, 100))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
