//! SQLite relational store.
//!
//! Four tables: `chats`, `chat_files`, `chat_messages` and `favourites`. Files,
//! messages and favourites reference their chat with `ON DELETE CASCADE`.
//! Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use docchat_core::chat::{Chat, ChatFile, ChatMessage, Favourite, FileKind, IndexStatus, Page, SqlDumpMeta};
use docchat_core::error::StoreError;
use docchat_core::message::Role;
use docchat_core::store::{RelationalStore, StoreResult, StoreSession};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Database(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        let statements = [
            (
                "chats table",
                r#"
                CREATE TABLE IF NOT EXISTS chats (
                    id                  TEXT PRIMARY KEY,
                    user_id             TEXT NOT NULL,
                    title               TEXT NOT NULL,
                    context             TEXT,
                    temperature         REAL,
                    model               TEXT,
                    avatar_path         TEXT,
                    created_at          TEXT NOT NULL,
                    updated_at          TEXT NOT NULL,
                    last_interaction_at TEXT
                )
                "#,
            ),
            (
                "chat_files table",
                r#"
                CREATE TABLE IF NOT EXISTS chat_files (
                    id           TEXT PRIMARY KEY,
                    chat_id      TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                    file_name    TEXT NOT NULL,
                    path_name    TEXT NOT NULL,
                    mime_type    TEXT NOT NULL,
                    kind         TEXT NOT NULL,
                    index_status TEXT NOT NULL,
                    index_error  TEXT,
                    source_url   TEXT,
                    sql_meta     TEXT,
                    created_at   TEXT NOT NULL,
                    updated_at   TEXT NOT NULL,
                    UNIQUE (chat_id, file_name)
                )
                "#,
            ),
            (
                "chat_messages table",
                r#"
                CREATE TABLE IF NOT EXISTS chat_messages (
                    iid               INTEGER PRIMARY KEY AUTOINCREMENT,
                    id                TEXT UNIQUE NOT NULL,
                    chat_id           TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                    role              TEXT NOT NULL,
                    text              TEXT NOT NULL,
                    block_type        TEXT NOT NULL,
                    additional_kwargs TEXT NOT NULL DEFAULT '{}',
                    created_at        TEXT NOT NULL
                )
                "#,
            ),
            (
                "favourites table",
                r#"
                CREATE TABLE IF NOT EXISTS favourites (
                    id         TEXT PRIMARY KEY,
                    user_id    TEXT NOT NULL,
                    chat_id    TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    UNIQUE (user_id, chat_id)
                )
                "#,
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_chat_messages_chat ON chat_messages(chat_id, created_at)",
            ),
            (
                "chats index",
                "CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at DESC)",
            ),
        ];

        for (label, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Database(format!("migration {label}: {e}")))?;
        }

        debug!("SQLite store migrations complete");
        Ok(())
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Database(format!("{name} column: {e}")))
}

fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Database(format!("{context}: {e}"))
}

fn row_to_chat(row: &SqliteRow) -> StoreResult<Chat> {
    let temperature: Option<f64> = col(row, "temperature")?;
    let last: Option<String> = col(row, "last_interaction_at")?;
    Ok(Chat {
        id: col(row, "id")?,
        user_id: col(row, "user_id")?,
        title: col(row, "title")?,
        context: col(row, "context")?,
        temperature: temperature.map(|t| t as f32),
        model: col(row, "model")?,
        avatar_path: col(row, "avatar_path")?,
        created_at: parse_ts(&col::<String>(row, "created_at")?),
        updated_at: parse_ts(&col::<String>(row, "updated_at")?),
        last_interaction_at: last.as_deref().map(parse_ts),
    })
}

fn row_to_file(row: &SqliteRow) -> StoreResult<ChatFile> {
    let sql_meta: Option<String> = col(row, "sql_meta")?;
    let sql = match sql_meta {
        Some(json) => Some(
            serde_json::from_str::<SqlDumpMeta>(&json)
                .map_err(|e| StoreError::Database(format!("sql_meta column: {e}")))?,
        ),
        None => None,
    };
    Ok(ChatFile {
        id: col(row, "id")?,
        chat_id: col(row, "chat_id")?,
        file_name: col(row, "file_name")?,
        path_name: col(row, "path_name")?,
        mime_type: col(row, "mime_type")?,
        kind: FileKind::parse(&col::<String>(row, "kind")?),
        index_status: IndexStatus::parse(&col::<String>(row, "index_status")?),
        index_error: col(row, "index_error")?,
        source_url: col(row, "source_url")?,
        sql,
        created_at: parse_ts(&col::<String>(row, "created_at")?),
        updated_at: parse_ts(&col::<String>(row, "updated_at")?),
    })
}

fn row_to_message(row: &SqliteRow) -> StoreResult<ChatMessage> {
    let kwargs: String = col(row, "additional_kwargs")?;
    Ok(ChatMessage {
        id: col(row, "id")?,
        chat_id: col(row, "chat_id")?,
        role: Role::parse(&col::<String>(row, "role")?),
        text: col(row, "text")?,
        block_type: col(row, "block_type")?,
        additional_kwargs: serde_json::from_str(&kwargs).unwrap_or_default(),
        created_at: parse_ts(&col::<String>(row, "created_at")?),
    })
}

fn row_to_favourite(row: &SqliteRow) -> StoreResult<Favourite> {
    Ok(Favourite {
        id: col(row, "id")?,
        user_id: col(row, "user_id")?,
        chat_id: col(row, "chat_id")?,
        created_at: parse_ts(&col::<String>(row, "created_at")?),
    })
}

fn sql_meta_json(file: &ChatFile) -> StoreResult<Option<String>> {
    file.sql
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Database(format!("sql_meta serialization: {e}")))
}

async fn insert_message<'e, E>(executor: E, message: &ChatMessage) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let kwargs = serde_json::Value::Object(message.additional_kwargs.clone()).to_string();
    sqlx::query(
        r#"
        INSERT INTO chat_messages (id, chat_id, role, text, block_type, additional_kwargs, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(message.role.as_str())
    .bind(&message.text)
    .bind(&message.block_type)
    .bind(kwargs)
    .bind(ts(&message.created_at))
    .execute(executor)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::chat_not_found(&message.chat_id)
        }
        _ => StoreError::Database(format!("INSERT message failed: {e}")),
    })?;
    Ok(())
}

#[async_trait]
impl RelationalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
        sqlx::query(
            r#"
            INSERT INTO chats (id, user_id, title, context, temperature, model, avatar_path,
                               created_at, updated_at, last_interaction_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&chat.id)
        .bind(&chat.user_id)
        .bind(&chat.title)
        .bind(&chat.context)
        .bind(chat.temperature.map(f64::from))
        .bind(&chat.model)
        .bind(&chat.avatar_path)
        .bind(ts(&chat.created_at))
        .bind(ts(&chat.updated_at))
        .bind(chat.last_interaction_at.as_ref().map(ts))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::AlreadyExists {
                entity: "chat",
                id: chat.id.clone(),
            },
            _ => StoreError::Database(format!("INSERT chat failed: {e}")),
        })?;
        debug!("Created chat {}", chat.id);
        Ok(chat)
    }

    async fn get_chat(&self, id: &str) -> StoreResult<Option<Chat>> {
        let row = sqlx::query("SELECT * FROM chats WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("SELECT chat"))?;
        row.as_ref().map(row_to_chat).transpose()
    }

    async fn list_chats(&self, user_id: &str) -> StoreResult<Vec<Chat>> {
        let rows = sqlx::query("SELECT * FROM chats WHERE user_id = ?1 ORDER BY updated_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("SELECT chats"))?;
        rows.iter().map(row_to_chat).collect()
    }

    async fn update_chat(&self, chat: &Chat) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE chats SET title = ?2, context = ?3, temperature = ?4, model = ?5,
                avatar_path = ?6, updated_at = ?7, last_interaction_at = ?8
            WHERE id = ?1
            "#,
        )
        .bind(&chat.id)
        .bind(&chat.title)
        .bind(&chat.context)
        .bind(chat.temperature.map(f64::from))
        .bind(&chat.model)
        .bind(&chat.avatar_path)
        .bind(ts(&chat.updated_at))
        .bind(chat.last_interaction_at.as_ref().map(ts))
        .execute(&self.pool)
        .await
        .map_err(db_err("UPDATE chat"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::chat_not_found(&chat.id));
        }
        Ok(())
    }

    async fn delete_chat(&self, id: &str) -> StoreResult<Vec<ChatFile>> {
        let mut tx = self.pool.begin().await.map_err(db_err("BEGIN"))?;
        let rows = sqlx::query("SELECT * FROM chat_files WHERE chat_id = ?1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err("SELECT chat files"))?;
        let files = rows.iter().map(row_to_file).collect::<StoreResult<Vec<_>>>()?;

        let result = sqlx::query("DELETE FROM chats WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("DELETE chat"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::chat_not_found(id));
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::CommitFailed(e.to_string()))?;
        debug!("Deleted chat {id} with {} files", files.len());
        Ok(files)
    }

    async fn add_file(&self, file: ChatFile) -> StoreResult<ChatFile> {
        let sql_meta = sql_meta_json(&file)?;
        sqlx::query(
            r#"
            INSERT INTO chat_files (id, chat_id, file_name, path_name, mime_type, kind, index_status,
                                    index_error, source_url, sql_meta, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&file.id)
        .bind(&file.chat_id)
        .bind(&file.file_name)
        .bind(&file.path_name)
        .bind(&file.mime_type)
        .bind(file.kind.as_str())
        .bind(file.index_status.as_str())
        .bind(&file.index_error)
        .bind(&file.source_url)
        .bind(sql_meta)
        .bind(ts(&file.created_at))
        .bind(ts(&file.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::AlreadyExists {
                entity: "file",
                id: file.file_name.clone(),
            },
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::chat_not_found(&file.chat_id)
            }
            _ => StoreError::Database(format!("INSERT file failed: {e}")),
        })?;
        Ok(file)
    }

    async fn get_file(&self, id: &str) -> StoreResult<Option<ChatFile>> {
        let row = sqlx::query("SELECT * FROM chat_files WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("SELECT file"))?;
        row.as_ref().map(row_to_file).transpose()
    }

    async fn list_files(&self, chat_id: &str) -> StoreResult<Vec<ChatFile>> {
        let rows = sqlx::query("SELECT * FROM chat_files WHERE chat_id = ?1 ORDER BY created_at, rowid")
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("SELECT files"))?;
        rows.iter().map(row_to_file).collect()
    }

    async fn update_file(&self, file: &ChatFile) -> StoreResult<()> {
        let sql_meta = sql_meta_json(file)?;
        let result = sqlx::query(
            r#"
            UPDATE chat_files SET file_name = ?2, path_name = ?3, mime_type = ?4, kind = ?5,
                index_status = ?6, index_error = ?7, source_url = ?8, sql_meta = ?9, updated_at = ?10
            WHERE id = ?1
            "#,
        )
        .bind(&file.id)
        .bind(&file.file_name)
        .bind(&file.path_name)
        .bind(&file.mime_type)
        .bind(file.kind.as_str())
        .bind(file.index_status.as_str())
        .bind(&file.index_error)
        .bind(&file.source_url)
        .bind(sql_meta)
        .bind(ts(&file.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err("UPDATE file"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::file_not_found(&file.id));
        }
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> StoreResult<Option<ChatFile>> {
        let Some(file) = self.get_file(id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM chat_files WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("DELETE file"))?;
        Ok(Some(file))
    }

    async fn recent_messages(&self, chat_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM chat_messages WHERE chat_id = ?1
                ORDER BY created_at DESC, iid DESC LIMIT ?2
            ) ORDER BY created_at ASC, iid ASC
            "#,
        )
        .bind(chat_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("SELECT recent messages"))?;
        rows.iter().map(row_to_message).collect()
    }

    async fn list_messages(&self, chat_id: &str, page: usize, size: usize) -> StoreResult<Page<ChatMessage>> {
        let page = page.max(1);
        let size = size.max(1);
        let total = self.count_messages(chat_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM chat_messages WHERE chat_id = ?1
            ORDER BY created_at DESC, iid DESC LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(chat_id)
        .bind(size as i64)
        .bind(((page - 1) * size) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("SELECT messages page"))?;
        let items = rows.iter().map(row_to_message).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page {
            items,
            total,
            page,
            size,
        })
    }

    async fn count_messages(&self, chat_id: &str) -> StoreResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chat_messages WHERE chat_id = ?1")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("COUNT messages"))?;
        let n: i64 = col(&row, "n")?;
        Ok(n as usize)
    }

    async fn add_favourite(&self, user_id: &str, chat_id: &str) -> StoreResult<Favourite> {
        let fav = Favourite::new(user_id, chat_id);
        sqlx::query(
            r#"
            INSERT INTO favourites (id, user_id, chat_id, created_at) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, chat_id) DO NOTHING
            "#,
        )
        .bind(&fav.id)
        .bind(&fav.user_id)
        .bind(&fav.chat_id)
        .bind(ts(&fav.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::chat_not_found(chat_id)
            }
            _ => StoreError::Database(format!("INSERT favourite failed: {e}")),
        })?;

        let row = sqlx::query("SELECT * FROM favourites WHERE user_id = ?1 AND chat_id = ?2")
            .bind(user_id)
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("SELECT favourite"))?;
        row_to_favourite(&row)
    }

    async fn remove_favourite(&self, user_id: &str, chat_id: &str) -> StoreResult<Option<Favourite>> {
        let row = sqlx::query("DELETE FROM favourites WHERE user_id = ?1 AND chat_id = ?2 RETURNING *")
            .bind(user_id)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("DELETE favourite"))?;
        row.as_ref().map(row_to_favourite).transpose()
    }

    async fn list_favourites(&self, user_id: &str) -> StoreResult<Vec<Favourite>> {
        let rows = sqlx::query("SELECT * FROM favourites WHERE user_id = ?1 ORDER BY created_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("SELECT favourites"))?;
        rows.iter().map(row_to_favourite).collect()
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>> {
        let tx = self.pool.begin().await.map_err(db_err("BEGIN"))?;
        Ok(Box::new(SqliteSession { tx }))
    }
}

/// A session backed by one SQLite transaction.
pub struct SqliteSession {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn get_chat(&mut self, id: &str) -> StoreResult<Option<Chat>> {
        let row = sqlx::query("SELECT * FROM chats WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("SELECT chat"))?;
        row.as_ref().map(row_to_chat).transpose()
    }

    async fn append_message(&mut self, message: ChatMessage) -> StoreResult<()> {
        insert_message(&mut *self.tx, &message).await
    }

    async fn touch_chat(&mut self, chat_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let stamp = ts(&at);
        let result = sqlx::query("UPDATE chats SET last_interaction_at = ?2, updated_at = ?2 WHERE id = ?1")
            .bind(chat_id)
            .bind(&stamp)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("UPDATE chat timestamp"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::chat_not_found(chat_id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::CommitFailed(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(db_err("ROLLBACK"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("docchat.db");
        let store = SqliteStore::new(&format!("sqlite://{}", path.display())).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn chat_roundtrip_and_listing() {
        let (store, _dir) = test_store().await;
        let chat = Chat::new("alice", "q3").with_model("llama3.1").with_temperature(0.2);
        store.create_chat(chat.clone()).await.unwrap();
        store.create_chat(Chat::new("bob", "other")).await.unwrap();

        let loaded = store.get_chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(loaded.model.as_deref(), Some("llama3.1"));
        assert_eq!(loaded.created_at, chat.created_at);
        assert_eq!(store.list_chats("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_commit_persists_pair_and_touch() {
        let (store, _dir) = test_store().await;
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        let at = Utc::now();

        let mut session = store.begin().await.unwrap();
        assert!(session.get_chat(&chat.id).await.unwrap().is_some());
        session.append_message(ChatMessage::user(&chat.id, "q")).await.unwrap();
        session.append_message(ChatMessage::assistant(&chat.id, "a")).await.unwrap();
        session.touch_chat(&chat.id, at).await.unwrap();
        session.commit().await.unwrap();

        let msgs = store.recent_messages(&chat.id, 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
        let chat = store.get_chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(chat.last_interaction_at, Some(at));
    }

    #[tokio::test]
    async fn session_rollback_discards() {
        let (store, _dir) = test_store().await;
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        let mut session = store.begin().await.unwrap();
        session.append_message(ChatMessage::user(&chat.id, "q")).await.unwrap();
        session.rollback().await.unwrap();
        assert_eq!(store.count_messages(&chat.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_sql_meta_survives_update() {
        let (store, _dir) = test_store().await;
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        let mut file = store
            .add_file(ChatFile::new(&chat.id, "shop.sql", "/tmp/shop.sql", "application/sql"))
            .await
            .unwrap();
        file.sql = Some(SqlDumpMeta {
            database_name: "dump_abc".into(),
            dialect: docchat_core::chat::SqlDialect::Postgres,
            tables: vec!["orders".into()],
        });
        file.mark_indexed();
        store.update_file(&file).await.unwrap();

        let loaded = store.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, FileKind::RelationalDump);
        assert_eq!(loaded.index_status, IndexStatus::Done);
        assert_eq!(loaded.sql.unwrap().tables, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_file_name_is_conflict() {
        let (store, _dir) = test_store().await;
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        store
            .add_file(ChatFile::new(&chat.id, "a.csv", "/tmp/a.csv", "text/csv"))
            .await
            .unwrap();
        let err = store
            .add_file(ChatFile::new(&chat.id, "a.csv", "/tmp/b.csv", "text/csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn delete_chat_cascades_and_returns_files() {
        let (store, _dir) = test_store().await;
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        store
            .add_file(ChatFile::new(&chat.id, "a.pdf", "/tmp/a.pdf", "application/pdf"))
            .await
            .unwrap();
        store.add_favourite("alice", &chat.id).await.unwrap();
        let mut session = store.begin().await.unwrap();
        session.append_message(ChatMessage::user(&chat.id, "q")).await.unwrap();
        session.commit().await.unwrap();

        let removed = store.delete_chat(&chat.id).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.count_messages(&chat.id).await.unwrap(), 0);
        assert!(store.list_favourites("alice").await.unwrap().is_empty());
        assert!(store.delete_chat(&chat.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn message_pages_are_newest_first() {
        let (store, _dir) = test_store().await;
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        let mut session = store.begin().await.unwrap();
        for i in 0..5 {
            session
                .append_message(ChatMessage::user(&chat.id, format!("m{i}")))
                .await
                .unwrap();
        }
        session.commit().await.unwrap();

        let page = store.list_messages(&chat.id, 1, 2).await.unwrap();
        let texts: Vec<_> = page.items.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m4", "m3"]);
        assert_eq!(page.total, 5);
    }

    #[tokio::test]
    async fn favourites_idempotent() {
        let (store, _dir) = test_store().await;
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        let a = store.add_favourite("alice", &chat.id).await.unwrap();
        let b = store.add_favourite("alice", &chat.id).await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(store.remove_favourite("alice", &chat.id).await.unwrap().is_some());
        assert!(store.list_favourites("alice").await.unwrap().is_empty());
    }
}
