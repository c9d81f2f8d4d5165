//! Upload storage, ingestion jobs, and cleanup of a file's derived state.
//!
//! A job takes a `Pending` file to `Done` or `Failed` and persists that status on
//! the file record. Failures never escape the job; they are logged and recorded.

use crate::error::IngestError;
use crate::extract::extract_text;
use docchat_config::IngestConfig;
use docchat_core::chat::{Chat, ChatFile, FileKind, SqlDialect, SqlDumpMeta};
use docchat_core::error::StoreError;
use docchat_core::store::RelationalStore;
use docchat_core::vector::KIND_TABLE_SCHEMA;
use docchat_core::web::FetchedPage;
use docchat_memory::{DocumentIndexer, TextChunker};
use docchat_tools::Frame;
use docchat_tools::sql::{SqlCatalog, SqlServers, detect_sql_dump_type, dump_database_name, split_statements};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Keep a stored file name recognizable while making it safe as a path component.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() { "upload".into() } else { cleaned.to_string() }
}

const AVATAR_TYPES: [(&str, &str); 4] = [
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

/// File extension for an accepted avatar image type.
pub fn avatar_extension(mime_type: &str) -> Option<&'static str> {
    let mime_type = mime_type.trim().to_ascii_lowercase();
    AVATAR_TYPES.iter().find(|(m, _)| *m == mime_type).map(|(_, ext)| *ext)
}

/// Content type of a stored avatar, from its extension.
pub fn avatar_content_type(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    AVATAR_TYPES
        .iter()
        .find(|(_, e)| *e == ext)
        .map(|(m, _)| *m)
        .unwrap_or("application/octet-stream")
}

async fn remove_path(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Could not remove stored file");
    }
}

pub struct Ingestor {
    store: Arc<dyn RelationalStore>,
    indexer: Arc<DocumentIndexer>,
    sql: Arc<dyn SqlServers>,
    upload_dir: PathBuf,
    documents: TextChunker,
    sheets: TextChunker,
}

impl Ingestor {
    pub fn new(
        config: &IngestConfig,
        store: Arc<dyn RelationalStore>,
        indexer: Arc<DocumentIndexer>,
        sql: Arc<dyn SqlServers>,
    ) -> Self {
        Self {
            store,
            indexer,
            sql,
            upload_dir: config.upload_dir.clone(),
            documents: TextChunker::new(config.chunk_size, config.chunk_overlap),
            sheets: TextChunker::new(config.spreadsheet_chunk_size, config.spreadsheet_chunk_overlap),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn indexer(&self) -> &Arc<DocumentIndexer> {
        &self.indexer
    }

    /// Directory holding one chat's stored files.
    pub fn chat_dir(&self, chat_id: &str) -> PathBuf {
        self.upload_dir.join(chat_id)
    }

    /// Write an upload to disk and attach it to the chat as a pending file.
    ///
    /// A name already attached to the chat is rejected with `AlreadyExists` and
    /// nothing is left on disk.
    pub async fn store_upload(
        &self,
        chat_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<ChatFile, IngestError> {
        let file = ChatFile::new(chat_id, file_name, "", mime_type);
        let stored_name = format!("{}_{}", file.id, sanitize_file_name(file_name));
        self.write_and_attach(file, &stored_name, bytes).await
    }

    /// Attach fetched web content to the chat as a pending web artifact named by its URL.
    pub async fn store_web_page(&self, chat_id: &str, page: &FetchedPage) -> Result<ChatFile, IngestError> {
        let file = ChatFile::web_artifact(chat_id, &page.url, "");
        let stored_name = format!("{}.txt", file.id);
        let body = match &page.title {
            Some(title) => format!("{title}\n\n{}", page.text),
            None => page.text.clone(),
        };
        self.write_and_attach(file, &stored_name, body.as_bytes()).await
    }

    async fn write_and_attach(
        &self,
        mut file: ChatFile,
        stored_name: &str,
        bytes: &[u8],
    ) -> Result<ChatFile, IngestError> {
        let dir = self.chat_dir(&file.chat_id);
        let path = dir.join(stored_name);
        file.path_name = path.to_string_lossy().into_owned();

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| IngestError::io(&dir, e))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| IngestError::io(&path, e))?;

        match self.store.add_file(file).await {
            Ok(file) => {
                info!(chat_id = %file.chat_id, file_id = %file.id, kind = file.kind.as_str(), bytes = bytes.len(), "Upload stored");
                Ok(file)
            }
            Err(e) => {
                remove_path(&path).await;
                Err(e.into())
            }
        }
    }

    /// Store a chat's avatar image as `avatar.<ext>` in its upload directory and
    /// record the path on the chat. A previous avatar of another type is removed.
    pub async fn store_avatar(&self, chat: &mut Chat, mime_type: &str, bytes: &[u8]) -> Result<(), IngestError> {
        let ext = avatar_extension(mime_type).ok_or_else(|| IngestError::UnsupportedAvatar(mime_type.to_string()))?;
        let dir = self.chat_dir(&chat.id);
        let path = dir.join(format!("avatar.{ext}"));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| IngestError::io(&dir, e))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| IngestError::io(&path, e))?;

        let path = path.to_string_lossy().into_owned();
        if let Some(previous) = chat.avatar_path.replace(path.clone())
            && previous != path
        {
            remove_path(Path::new(&previous)).await;
        }
        chat.updated_at = chrono::Utc::now();
        self.store.update_chat(chat).await?;
        info!(chat_id = %chat.id, bytes = bytes.len(), "Avatar stored");
        Ok(())
    }

    /// Read a chat's avatar with its content type; `None` when it has none.
    pub async fn read_avatar(&self, chat: &Chat) -> Result<Option<(Vec<u8>, &'static str)>, IngestError> {
        let Some(path) = chat.avatar_path.as_deref().map(Path::new) else {
            return Ok(None);
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some((bytes, avatar_content_type(path)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(chat_id = %chat.id, path = %path.display(), "Avatar file missing");
                Ok(None)
            }
            Err(e) => Err(IngestError::io(path, e)),
        }
    }

    /// Run the file's ingestion job in the background.
    pub fn spawn(self: &Arc<Self>, file: ChatFile) -> JoinHandle<ChatFile> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.ingest(file).await })
    }

    /// Run the ingestion job for one file and persist its final status.
    pub async fn ingest(&self, mut file: ChatFile) -> ChatFile {
        debug!(file_id = %file.id, kind = file.kind.as_str(), "Ingestion started");
        let outcome = match file.kind {
            FileKind::GenericDocument | FileKind::WebArtifact => self.index_document(&file).await,
            FileKind::Spreadsheet => self.index_spreadsheet(&file).await,
            FileKind::RelationalDump => self.load_dump(&mut file).await,
        };

        match outcome {
            Ok(rows) => {
                file.mark_indexed();
                info!(chat_id = %file.chat_id, file_id = %file.id, rows, "Ingestion finished");
            }
            Err(e) => {
                error!(chat_id = %file.chat_id, file_id = %file.id, file_name = %file.file_name, error = %e, "Ingestion failed");
                file.mark_failed(e.to_string());
            }
        }

        match self.store.get_file(&file.id).await {
            Ok(Some(_)) => {
                if let Err(e) = self.store.update_file(&file).await {
                    error!(file_id = %file.id, error = %e, "Could not persist ingestion status");
                }
            }
            Ok(None) => {
                // Deleted while the job ran: drop what the job produced.
                warn!(file_id = %file.id, "File removed during ingestion; discarding its index");
                self.cleanup(&file).await;
            }
            Err(e) => error!(file_id = %file.id, error = %e, "Could not persist ingestion status"),
        }
        file
    }

    async fn index_document(&self, file: &ChatFile) -> Result<usize, IngestError> {
        let text = extract_text(file).await?;
        Ok(self.indexer.index_text(file, &text, &self.documents).await?)
    }

    /// Render the sheet as a markdown table and index it alongside the dataframe tool.
    async fn index_spreadsheet(&self, file: &ChatFile) -> Result<usize, IngestError> {
        let owned = file.clone();
        let frame = tokio::task::spawn_blocking(move || Frame::load(&owned))
            .await
            .map_err(|e| IngestError::Extract(e.to_string()))??;
        let markdown = frame.to_markdown(None);
        Ok(self.indexer.index_text(file, &markdown, &self.sheets).await?)
    }

    /// Materialize a dump into its own database and index one schema document per table.
    async fn load_dump(&self, file: &mut ChatFile) -> Result<usize, IngestError> {
        let path = Path::new(&file.path_name);
        let bytes = tokio::fs::read(path).await.map_err(|e| IngestError::io(path, e))?;
        let script = String::from_utf8_lossy(&bytes);

        let dialect = detect_sql_dump_type(&script);
        if dialect == SqlDialect::Unknown {
            return Err(IngestError::UnknownDialect);
        }
        let database = dump_database_name(&file.id);
        info!(file_id = %file.id, %dialect, database, "Loading SQL dump");

        self.sql.provision(dialect, &database).await?;
        match self.populate_dump(file, dialect, &database, &script).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                if let Err(drop_err) = self.sql.drop_database(dialect, &database).await {
                    warn!(database, error = %drop_err, "Could not drop database of failed dump");
                }
                Err(e)
            }
        }
    }

    async fn populate_dump(
        &self,
        file: &mut ChatFile,
        dialect: SqlDialect,
        database: &str,
        script: &str,
    ) -> Result<usize, IngestError> {
        let statements = split_statements(script);
        let executed = self.sql.load(dialect, database, &statements).await?;
        debug!(file_id = %file.id, executed, "Dump statements executed");

        let catalog = self.sql.open(dialect, database).await?;
        let tables = catalog.list_tables().await?;
        let mut documents = Vec::with_capacity(tables.len());
        for table in &tables {
            documents.push(catalog.describe_table(table).await?.render());
        }

        file.sql = Some(SqlDumpMeta {
            database_name: database.to_string(),
            dialect,
            tables,
        });
        Ok(self.indexer.index_documents(file, KIND_TABLE_SCHEMA, documents).await?)
    }

    /// Remove a file's vector rows, dump database and stored bytes.
    async fn cleanup(&self, file: &ChatFile) {
        if let Err(e) = self.indexer.delete_file_index(&file.id).await {
            error!(file_id = %file.id, error = %e, "Could not delete file index");
        }
        if let Some(meta) = &file.sql
            && let Err(e) = self.sql.drop_database(meta.dialect, &meta.database_name).await
        {
            error!(file_id = %file.id, database = %meta.database_name, error = %e, "Could not drop dump database");
        }
        remove_path(Path::new(&file.path_name)).await;
    }

    /// Delete one file and everything derived from it.
    pub async fn delete_file(&self, file_id: &str) -> Result<ChatFile, IngestError> {
        let file = self
            .store
            .delete_file(file_id)
            .await?
            .ok_or_else(|| StoreError::file_not_found(file_id))?;
        self.cleanup(&file).await;
        info!(chat_id = %file.chat_id, file_id, "File deleted");
        Ok(file)
    }

    /// Delete a chat with its messages and files, including every file's derived state.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<usize, IngestError> {
        let files = self.store.delete_chat(chat_id).await?;
        for file in &files {
            self.cleanup(file).await;
        }
        let dir = self.chat_dir(chat_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %dir.display(), error = %e, "Could not remove chat upload directory");
        }
        info!(chat_id, files = files.len(), "Chat deleted");
        Ok(files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docchat_core::chat::{Chat, IndexStatus};
    use docchat_core::error::ProviderError;
    use docchat_core::message::Message;
    use docchat_core::provider::{EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest, ProviderResponse};
    use docchat_core::vector::{KIND_CHUNK, KIND_KEY, Predicate, VectorStore};
    use docchat_memory::InMemoryVectorStore;
    use docchat_store::InMemoryStore;
    use docchat_tools::MemorySqlServers;

    struct LengthEmbedder;

    #[async_trait]
    impl Provider for LengthEmbedder {
        fn name(&self) -> &str {
            "length"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                message: Message::assistant(""),
                usage: None,
                model: request.model,
                metadata: serde_json::Map::new(),
            })
        }

        async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
            Ok(EmbeddingResponse {
                embeddings: request.inputs.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                model: request.model,
                usage: None,
            })
        }

        fn supports_embeddings(&self) -> bool {
            true
        }
    }

    const MYSQL_DUMP: &str = "CREATE DATABASE shop;\nUSE shop;\n\
        CREATE TABLE `orders` (`id` int NOT NULL AUTO_INCREMENT, `total` int) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;\n\
        LOCK TABLES `orders` WRITE;\nINSERT INTO `orders` VALUES (1,10),(2,32);\nUNLOCK TABLES;\n";
    const PG_DUMP: &str = "SET search_path = public;\n\
        CREATE TABLE people (id bigserial, name text);\nINSERT INTO people VALUES (1, 'Ada');\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryStore>,
        vectors: Arc<InMemoryVectorStore>,
        sql: MemorySqlServers,
        ingestor: Arc<Ingestor>,
        chat_id: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let chat = store.create_chat(Chat::new("alice", "docs")).await.unwrap();
        let vectors = Arc::new(InMemoryVectorStore::new());
        let indexer = Arc::new(DocumentIndexer::new(Arc::new(LengthEmbedder), vectors.clone(), "embed"));
        let sql = MemorySqlServers::new();
        let config = IngestConfig {
            upload_dir: dir.path().to_path_buf(),
            chunk_size: 64,
            chunk_overlap: 8,
            spreadsheet_chunk_size: 32,
            spreadsheet_chunk_overlap: 4,
        };
        let ingestor = Arc::new(Ingestor::new(&config, store.clone(), indexer, Arc::new(sql.clone())));
        Fixture {
            _dir: dir,
            store,
            vectors,
            sql,
            ingestor,
            chat_id: chat.id,
        }
    }

    impl Fixture {
        async fn upload(&self, name: &str, mime: &str, body: &str) -> ChatFile {
            self.ingestor
                .store_upload(&self.chat_id, name, mime, body.as_bytes())
                .await
                .unwrap()
        }

        async fn rows(&self, file: &ChatFile) -> usize {
            self.vectors.count(&[Predicate::file(&file.id)]).await.unwrap()
        }
    }

    #[tokio::test]
    async fn document_job_indexes_and_marks_done() {
        let fx = fixture().await;
        let file = fx.upload("notes.txt", "text/plain", "The launch is scheduled for March.").await;
        assert_eq!(file.index_status, IndexStatus::Pending);

        let file = fx.ingestor.spawn(file).await.unwrap();
        assert_eq!(file.index_status, IndexStatus::Done);
        assert_eq!(fx.rows(&file).await, 1);

        let stored = fx.store.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.index_status, IndexStatus::Done);
        let chunks = [Predicate::file(&file.id), Predicate::eq(KIND_KEY, KIND_CHUNK)];
        assert_eq!(fx.vectors.count(&chunks).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn web_pages_are_ingested_as_artifacts() {
        let fx = fixture().await;
        let page = FetchedPage {
            url: "https://example.com/pricing".into(),
            title: Some("Pricing".into()),
            text: "The pro plan costs 12 euros.".into(),
        };
        let file = fx.ingestor.store_web_page(&fx.chat_id, &page).await.unwrap();
        assert_eq!(file.kind, FileKind::WebArtifact);
        assert_eq!(file.file_name, "https://example.com/pricing");
        assert_eq!(file.source_url.as_deref(), Some("https://example.com/pricing"));

        let file = fx.ingestor.ingest(file).await;
        assert_eq!(file.index_status, IndexStatus::Done);
        assert!(fx.rows(&file).await > 0);
    }

    #[tokio::test]
    async fn failed_extraction_is_recorded_on_the_file() {
        let fx = fixture().await;
        let file = fx.upload("scan.pdf", "application/pdf", "definitely not a pdf").await;
        let file = fx.ingestor.ingest(file).await;
        assert_eq!(file.index_status, IndexStatus::Failed);

        let stored = fx.store.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.index_status, IndexStatus::Failed);
        assert!(stored.index_error.is_some());
        assert_eq!(fx.rows(&file).await, 0);
    }

    #[tokio::test]
    async fn spreadsheet_job_indexes_the_rendered_table() {
        let fx = fixture().await;
        let file = fx.upload("sales.csv", "text/csv", "region,amount\nnorth,10\nsouth,20\n").await;
        assert_eq!(file.kind, FileKind::Spreadsheet);
        let file = fx.ingestor.ingest(file).await;
        assert_eq!(file.index_status, IndexStatus::Done);
        assert!(fx.rows(&file).await >= 1);
    }

    #[tokio::test]
    async fn mysql_dump_gets_its_own_database_and_schema_index() {
        let fx = fixture().await;
        let file = fx.upload("shop.sql", "application/sql", MYSQL_DUMP).await;
        let file = fx.ingestor.ingest(file).await;
        assert_eq!(file.index_status, IndexStatus::Done, "{:?}", file.index_error);

        let meta = file.sql.clone().unwrap();
        assert_eq!(meta.dialect, SqlDialect::MySql);
        assert_eq!(meta.database_name, dump_database_name(&file.id));
        assert_eq!(meta.tables, vec!["orders"]);
        assert_eq!(fx.sql.databases().await, vec![meta.database_name.clone()]);

        let schema = [Predicate::file(&file.id), Predicate::eq(KIND_KEY, KIND_TABLE_SCHEMA)];
        assert_eq!(fx.vectors.count(&schema).await.unwrap(), 1);
        let stored = fx.store.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.sql, Some(meta));
    }

    #[tokio::test]
    async fn two_dumps_never_share_a_database() {
        let fx = fixture().await;
        let a = fx.ingestor.ingest(fx.upload("a.sql", "application/sql", MYSQL_DUMP).await).await;
        let b = fx.ingestor.ingest(fx.upload("b.sql", "application/sql", PG_DUMP).await).await;
        let (a, b) = (a.sql.unwrap(), b.sql.unwrap());
        assert_eq!(b.dialect, SqlDialect::Postgres);
        assert_ne!(a.database_name, b.database_name);
        assert_eq!(fx.sql.databases().await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_dialect_fails_without_a_database() {
        let fx = fixture().await;
        let file = fx.upload("plain.sql", "application/sql", "CREATE TABLE t (id int);").await;
        let file = fx.ingestor.ingest(file).await;
        assert_eq!(file.index_status, IndexStatus::Failed);
        assert!(file.sql.is_none());
        assert!(fx.sql.databases().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_upload_is_rejected_and_leaves_nothing_behind() {
        let fx = fixture().await;
        fx.upload("a.txt", "text/plain", "one").await;
        let err = fx
            .ingestor
            .store_upload(&fx.chat_id, "a.txt", "text/plain", b"two")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store(StoreError::AlreadyExists { .. })));
        let stored = std::fs::read_dir(fx.ingestor.chat_dir(&fx.chat_id)).unwrap().count();
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn delete_file_removes_every_derived_artifact() {
        let fx = fixture().await;
        let file = fx.ingestor.ingest(fx.upload("shop.sql", "application/sql", MYSQL_DUMP).await).await;
        let keep = fx.ingestor.ingest(fx.upload("keep.txt", "text/plain", "keep me").await).await;

        fx.ingestor.delete_file(&file.id).await.unwrap();
        assert_eq!(fx.rows(&file).await, 0);
        assert!(fx.sql.databases().await.is_empty());
        assert!(!Path::new(&file.path_name).exists());
        assert!(fx.store.get_file(&file.id).await.unwrap().is_none());
        assert_eq!(fx.rows(&keep).await, 1);

        let err = fx.ingestor.delete_file(&file.id).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn delete_chat_cascades_through_files() {
        let fx = fixture().await;
        let doc = fx.ingestor.ingest(fx.upload("a.txt", "text/plain", "alpha").await).await;
        let dump = fx.ingestor.ingest(fx.upload("b.sql", "application/sql", PG_DUMP).await).await;

        assert_eq!(fx.ingestor.delete_chat(&fx.chat_id).await.unwrap(), 2);
        assert_eq!(fx.rows(&doc).await, 0);
        assert_eq!(fx.rows(&dump).await, 0);
        assert!(fx.sql.databases().await.is_empty());
        assert!(!fx.ingestor.chat_dir(&fx.chat_id).exists());
        assert!(fx.store.get_chat(&fx.chat_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_deleted_mid_job_leaves_no_index() {
        let fx = fixture().await;
        let file = fx.upload("a.txt", "text/plain", "alpha").await;
        fx.store.delete_file(&file.id).await.unwrap();
        let file = fx.ingestor.ingest(file).await;
        assert_eq!(fx.rows(&file).await, 0);
    }

    #[test]
    fn stored_names_are_path_safe() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("Q3 report (final).pdf"), "Q3_report__final_.pdf");
        assert_eq!(sanitize_file_name(""), "upload");
    }

    #[tokio::test]
    async fn pg_dump_copy_rows_are_loaded() {
        let fx = fixture().await;
        let dump = "SET search_path = public;\n\
            CREATE TABLE people (id bigserial, name text);\n\
            COPY public.people (id, name) FROM stdin;\n\
            1\tAda\n\
            2\tGrace\n\
            \\.\n";
        let file = fx.ingestor.ingest(fx.upload("people.sql", "application/sql", dump).await).await;
        assert_eq!(file.index_status, IndexStatus::Done, "{:?}", file.index_error);

        let meta = file.sql.unwrap();
        let catalog = fx.sql.open(meta.dialect, &meta.database_name).await.unwrap();
        let count = catalog.query("SELECT COUNT(*) FROM people", 10).await.unwrap();
        assert_eq!(count.rows[0][0], "2");
    }

    #[tokio::test]
    async fn avatars_are_stored_replaced_and_read_back() {
        let fx = fixture().await;
        let mut chat = fx.store.get_chat(&fx.chat_id).await.unwrap().unwrap();
        assert!(fx.ingestor.read_avatar(&chat).await.unwrap().is_none());

        fx.ingestor.store_avatar(&mut chat, "image/png", b"png-bytes").await.unwrap();
        let png_path = chat.avatar_path.clone().unwrap();
        assert!(png_path.ends_with("avatar.png"));
        let stored = fx.store.get_chat(&fx.chat_id).await.unwrap().unwrap();
        assert_eq!(stored.avatar_path.as_deref(), Some(png_path.as_str()));

        fx.ingestor.store_avatar(&mut chat, "IMAGE/JPEG", b"jpg-bytes").await.unwrap();
        assert!(!Path::new(&png_path).exists());
        let (bytes, content_type) = fx.ingestor.read_avatar(&chat).await.unwrap().unwrap();
        assert_eq!(bytes, b"jpg-bytes");
        assert_eq!(content_type, "image/jpeg");

        let err = fx.ingestor.store_avatar(&mut chat, "text/html", b"<p>").await.unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedAvatar(_)));

        let jpg_path = chat.avatar_path.clone().unwrap();
        fx.ingestor.delete_chat(&fx.chat_id).await.unwrap();
        assert!(!Path::new(&jpg_path).exists());
    }
}
