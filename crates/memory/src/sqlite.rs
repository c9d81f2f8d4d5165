//! SQLite vector store.
//!
//! One table, `vectors`: text, embedding as a little-endian f32 BLOB and the
//! metadata map as JSON. Predicates are pushed down with `json_extract`, so only
//! rows already inside the requested scope are decoded and scored.

use crate::vector::rank_records;
use async_trait::async_trait;
use docchat_core::error::VectorError;
use docchat_core::vector::{
    FILE_ID_KEY, Predicate, SESSION_ID_KEY, ScoredRecord, VectorQuery, VectorRecord, VectorStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// Metadata keys with an expression index. Predicates on them are written with
/// the literal JSON path so the planner can match the index.
const INDEXED_KEYS: [&str; 2] = [FILE_ID_KEY, SESSION_ID_KEY];

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Open (or create) the vector database at `path`.
    pub async fn new(path: &str) -> Result<Self, VectorError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| VectorError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| VectorError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite vector store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), VectorError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                iid       INTEGER PRIMARY KEY AUTOINCREMENT,
                id        TEXT UNIQUE NOT NULL,
                text      TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata  TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| VectorError::Storage(format!("vectors table: {e}")))?;

        for key in INDEXED_KEYS {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_vectors_{key} ON vectors(json_extract(metadata, '$.{key}'))"
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| VectorError::Storage(format!("{key} index: {e}")))?;
        }
        // Superseded by idx_vectors_file_id.
        sqlx::query("DROP INDEX IF EXISTS idx_vectors_file")
            .execute(&self.pool)
            .await
            .map_err(|e| VectorError::Storage(format!("drop old index: {e}")))?;

        debug!("SQLite vector migrations complete");
        Ok(())
    }

    fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_record(row: &SqliteRow) -> Result<VectorRecord, VectorError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| VectorError::QueryFailed(format!("id column: {e}")))?;
        let text: String = row
            .try_get("text")
            .map_err(|e| VectorError::QueryFailed(format!("text column: {e}")))?;
        let blob: Vec<u8> = row
            .try_get("embedding")
            .map_err(|e| VectorError::QueryFailed(format!("embedding column: {e}")))?;
        let metadata_json: String = row
            .try_get("metadata")
            .map_err(|e| VectorError::QueryFailed(format!("metadata column: {e}")))?;

        Ok(VectorRecord {
            id,
            text,
            embedding: Self::blob_to_embedding(&blob),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        })
    }

    /// Build a `WHERE` clause over the metadata JSON and the values to bind to
    /// it, in order.
    fn where_clause(predicates: &[Predicate]) -> (String, Vec<String>) {
        if predicates.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut binds = Vec::with_capacity(predicates.len() * 2);
        let conditions: Vec<String> = predicates
            .iter()
            .map(|p| match INDEXED_KEYS.iter().find(|k| **k == p.key) {
                Some(key) => {
                    binds.push(p.value.clone());
                    format!("json_extract(metadata, '$.{key}') = ?")
                }
                None => {
                    binds.push(Self::json_path(&p.key));
                    binds.push(p.value.clone());
                    "json_extract(metadata, ?) = ?".to_string()
                }
            })
            .collect();
        (format!("WHERE {}", conditions.join(" AND ")), binds)
    }

    fn json_path(key: &str) -> String {
        format!("$.\"{}\"", key.replace('"', ""))
    }

    async fn fetch_scoped(&self, predicates: &[Predicate]) -> Result<Vec<VectorRecord>, VectorError> {
        let (clause, binds) = Self::where_clause(predicates);
        let sql = format!("SELECT * FROM vectors {clause}");
        let mut q = sqlx::query(&sql);
        for value in binds {
            q = q.bind(value);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VectorError::QueryFailed(format!("scoped scan: {e}")))?;
        rows.iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize, VectorError> {
        let n = records.len();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VectorError::Storage(format!("BEGIN: {e}")))?;
        for record in &records {
            let metadata = serde_json::Value::Object(record.metadata.clone()).to_string();
            sqlx::query(
                r#"
                INSERT INTO vectors (id, text, embedding, metadata) VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    embedding = excluded.embedding,
                    metadata = excluded.metadata
                "#,
            )
            .bind(&record.id)
            .bind(&record.text)
            .bind(Self::embedding_to_blob(&record.embedding))
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| VectorError::Storage(format!("INSERT failed: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| VectorError::Storage(format!("COMMIT: {e}")))?;
        debug!("Upserted {n} vectors");
        Ok(n)
    }

    async fn delete(&self, predicates: &[Predicate]) -> Result<usize, VectorError> {
        if predicates.is_empty() {
            return Err(VectorError::Storage("refusing unscoped delete".into()));
        }
        let (clause, binds) = Self::where_clause(predicates);
        let sql = format!("DELETE FROM vectors {clause}");
        let mut q = sqlx::query(&sql);
        for value in binds {
            q = q.bind(value);
        }
        let result = q
            .execute(&self.pool)
            .await
            .map_err(|e| VectorError::Storage(format!("DELETE failed: {e}")))?;
        Ok(result.rows_affected() as usize)
    }

    async fn query(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>, VectorError> {
        query.ensure_scoped()?;
        let candidates = self.fetch_scoped(&query.predicates).await?;
        rank_records(candidates.iter(), query)
    }

    async fn count(&self, predicates: &[Predicate]) -> Result<usize, VectorError> {
        let (clause, binds) = Self::where_clause(predicates);
        let sql = format!("SELECT COUNT(*) AS n FROM vectors {clause}");
        let mut q = sqlx::query(&sql);
        for value in binds {
            q = q.bind(value);
        }
        let row = q
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VectorError::QueryFailed(format!("COUNT: {e}")))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| VectorError::QueryFailed(format!("n column: {e}")))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docchat_core::vector::{FILE_ID_KEY, KIND_KEY};
    use tempfile::TempDir;

    async fn test_store() -> (SqliteVectorStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vectors.db");
        let store = SqliteVectorStore::new(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        (store, dir)
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![0.5f32, -1.25, 3.0];
        let blob = SqliteVectorStore::embedding_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(SqliteVectorStore::blob_to_embedding(&blob), v);
    }

    #[tokio::test]
    async fn scoped_query_and_delete() {
        let (store, _dir) = test_store().await;
        store
            .upsert(vec![
                VectorRecord::new("alpha", vec![1.0, 0.0])
                    .tag(FILE_ID_KEY, "f1")
                    .tag(KIND_KEY, "chunk"),
                VectorRecord::new("beta", vec![1.0, 0.0])
                    .tag(FILE_ID_KEY, "f2")
                    .tag(KIND_KEY, "chunk"),
            ])
            .await
            .unwrap();

        let hits = store
            .query(&VectorQuery::new(vec![1.0, 0.0], vec![Predicate::file("f1")], 5))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.text, "alpha");
        assert_eq!(hits[0].record.file_id(), Some("f1"));

        let both = [Predicate::file("f2"), Predicate::eq(KIND_KEY, "chunk")];
        assert_eq!(store.count(&both).await.unwrap(), 1);
        assert_eq!(store.delete(&[Predicate::file("f2")]).await.unwrap(), 1);
        assert_eq!(store.count(&[]).await.unwrap(), 1);
    }

    #[test]
    fn indexed_keys_use_literal_paths() {
        let (clause, binds) =
            SqliteVectorStore::where_clause(&[Predicate::file("f1"), Predicate::eq(KIND_KEY, "chunk")]);
        assert_eq!(
            clause,
            "WHERE json_extract(metadata, '$.file_id') = ? AND json_extract(metadata, ?) = ?"
        );
        assert_eq!(binds, vec!["f1", "$.\"kind\"", "chunk"]);
    }

    #[tokio::test]
    async fn file_scope_is_served_by_the_index() {
        let (store, _dir) = test_store().await;
        let (clause, binds) = SqliteVectorStore::where_clause(&[Predicate::file("f1")]);
        let sql = format!("EXPLAIN QUERY PLAN SELECT * FROM vectors {clause}");
        let mut q = sqlx::query(&sql);
        for value in binds {
            q = q.bind(value);
        }
        let plan: Vec<String> = q
            .fetch_all(&store.pool)
            .await
            .unwrap()
            .iter()
            .map(|row| row.get::<String, _>("detail"))
            .collect();
        assert!(plan.iter().any(|d| d.contains("idx_vectors_file_id")), "{plan:?}");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_id() {
        let (store, _dir) = test_store().await;
        let rec = VectorRecord::new("x", vec![1.0]).tag(FILE_ID_KEY, "f");
        store.upsert(vec![rec.clone()]).await.unwrap();
        store.upsert(vec![rec]).await.unwrap();
        assert_eq!(store.count(&[Predicate::file("f")]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unscoped_query_refused() {
        let (store, _dir) = test_store().await;
        assert!(store.query(&VectorQuery::new(vec![1.0], vec![], 3)).await.is_err());
    }
}
