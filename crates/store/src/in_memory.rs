//! In-memory store. Sessions stage their writes and apply them under one
//! write lock on commit, so readers never see half a turn.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docchat_core::chat::{Chat, ChatFile, ChatMessage, Favourite, Page};
use docchat_core::error::StoreError;
use docchat_core::store::{RelationalStore, StoreResult, StoreSession};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    chats: Vec<Chat>,
    files: Vec<ChatFile>,
    messages: Vec<ChatMessage>,
    favourites: Vec<Favourite>,
}

/// Process-local relational store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    fail_commits: Arc<AtomicBool>,
    commits: Arc<AtomicUsize>,
    begin_delay_ms: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent session commit fail (for exercising rollback paths).
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make opening a session take this long, like a contended database pool.
    pub fn set_begin_delay(&self, delay: Duration) {
        self.begin_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of sessions committed successfully so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

enum Staged {
    Message(ChatMessage),
    Touch(String, DateTime<Utc>),
}

pub struct InMemorySession {
    tables: Arc<RwLock<Tables>>,
    fail_commit: bool,
    commits: Arc<AtomicUsize>,
    staged: Vec<Staged>,
}

fn newest_first(mut messages: Vec<(usize, ChatMessage)>) -> Vec<ChatMessage> {
    messages.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
    messages.into_iter().map(|(_, m)| m).collect()
}

impl Tables {
    fn chat_messages(&self, chat_id: &str) -> Vec<(usize, ChatMessage)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.chat_id == chat_id)
            .map(|(i, m)| (i, m.clone()))
            .collect()
    }
}

#[async_trait]
impl RelationalStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
        let mut t = self.tables.write().await;
        if t.chats.iter().any(|c| c.id == chat.id) {
            return Err(StoreError::AlreadyExists {
                entity: "chat",
                id: chat.id,
            });
        }
        t.chats.push(chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, id: &str) -> StoreResult<Option<Chat>> {
        Ok(self.tables.read().await.chats.iter().find(|c| c.id == id).cloned())
    }

    async fn list_chats(&self, user_id: &str) -> StoreResult<Vec<Chat>> {
        let t = self.tables.read().await;
        let mut chats: Vec<Chat> = t.chats.iter().filter(|c| c.user_id == user_id).cloned().collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn update_chat(&self, chat: &Chat) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let slot = t
            .chats
            .iter_mut()
            .find(|c| c.id == chat.id)
            .ok_or_else(|| StoreError::chat_not_found(&chat.id))?;
        *slot = chat.clone();
        Ok(())
    }

    async fn delete_chat(&self, id: &str) -> StoreResult<Vec<ChatFile>> {
        let mut t = self.tables.write().await;
        let before = t.chats.len();
        t.chats.retain(|c| c.id != id);
        if t.chats.len() == before {
            return Err(StoreError::chat_not_found(id));
        }
        t.messages.retain(|m| m.chat_id != id);
        t.favourites.retain(|f| f.chat_id != id);
        let (removed, kept): (Vec<ChatFile>, Vec<ChatFile>) =
            std::mem::take(&mut t.files).into_iter().partition(|f| f.chat_id == id);
        t.files = kept;
        Ok(removed)
    }

    async fn add_file(&self, file: ChatFile) -> StoreResult<ChatFile> {
        let mut t = self.tables.write().await;
        if !t.chats.iter().any(|c| c.id == file.chat_id) {
            return Err(StoreError::chat_not_found(&file.chat_id));
        }
        if t
            .files
            .iter()
            .any(|f| f.chat_id == file.chat_id && f.file_name == file.file_name)
        {
            return Err(StoreError::AlreadyExists {
                entity: "file",
                id: file.file_name,
            });
        }
        t.files.push(file.clone());
        Ok(file)
    }

    async fn get_file(&self, id: &str) -> StoreResult<Option<ChatFile>> {
        Ok(self.tables.read().await.files.iter().find(|f| f.id == id).cloned())
    }

    async fn list_files(&self, chat_id: &str) -> StoreResult<Vec<ChatFile>> {
        let t = self.tables.read().await;
        Ok(t.files.iter().filter(|f| f.chat_id == chat_id).cloned().collect())
    }

    async fn update_file(&self, file: &ChatFile) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let slot = t
            .files
            .iter_mut()
            .find(|f| f.id == file.id)
            .ok_or_else(|| StoreError::file_not_found(&file.id))?;
        *slot = file.clone();
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> StoreResult<Option<ChatFile>> {
        let mut t = self.tables.write().await;
        let pos = t.files.iter().position(|f| f.id == id);
        Ok(pos.map(|i| t.files.remove(i)))
    }

    async fn recent_messages(&self, chat_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let t = self.tables.read().await;
        let mut recent: Vec<ChatMessage> = newest_first(t.chat_messages(chat_id))
            .into_iter()
            .take(limit)
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn list_messages(&self, chat_id: &str, page: usize, size: usize) -> StoreResult<Page<ChatMessage>> {
        let t = self.tables.read().await;
        let all = newest_first(t.chat_messages(chat_id));
        let page = page.max(1);
        let size = size.max(1);
        let total = all.len();
        let items = all.into_iter().skip((page - 1) * size).take(size).collect();
        Ok(Page {
            items,
            total,
            page,
            size,
        })
    }

    async fn count_messages(&self, chat_id: &str) -> StoreResult<usize> {
        let t = self.tables.read().await;
        Ok(t.messages.iter().filter(|m| m.chat_id == chat_id).count())
    }

    async fn add_favourite(&self, user_id: &str, chat_id: &str) -> StoreResult<Favourite> {
        let mut t = self.tables.write().await;
        if let Some(existing) = t
            .favourites
            .iter()
            .find(|f| f.user_id == user_id && f.chat_id == chat_id)
        {
            return Ok(existing.clone());
        }
        if !t.chats.iter().any(|c| c.id == chat_id) {
            return Err(StoreError::chat_not_found(chat_id));
        }
        let fav = Favourite::new(user_id, chat_id);
        t.favourites.push(fav.clone());
        Ok(fav)
    }

    async fn remove_favourite(&self, user_id: &str, chat_id: &str) -> StoreResult<Option<Favourite>> {
        let mut t = self.tables.write().await;
        let pos = t
            .favourites
            .iter()
            .position(|f| f.user_id == user_id && f.chat_id == chat_id);
        Ok(pos.map(|i| t.favourites.remove(i)))
    }

    async fn list_favourites(&self, user_id: &str) -> StoreResult<Vec<Favourite>> {
        let t = self.tables.read().await;
        Ok(t.favourites.iter().filter(|f| f.user_id == user_id).cloned().collect())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>> {
        let delay = self.begin_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(Box::new(InMemorySession {
            tables: Arc::clone(&self.tables),
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
            commits: Arc::clone(&self.commits),
            staged: Vec::new(),
        }))
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn get_chat(&mut self, id: &str) -> StoreResult<Option<Chat>> {
        Ok(self.tables.read().await.chats.iter().find(|c| c.id == id).cloned())
    }

    async fn append_message(&mut self, message: ChatMessage) -> StoreResult<()> {
        self.staged.push(Staged::Message(message));
        Ok(())
    }

    async fn touch_chat(&mut self, chat_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.staged.push(Staged::Touch(chat_id.to_string(), at));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.fail_commit {
            return Err(StoreError::CommitFailed("injected commit failure".into()));
        }
        let mut t = self.tables.write().await;

        // Validate everything first; a commit applies all staged writes or none.
        for op in &self.staged {
            let chat_id = match op {
                Staged::Message(m) => &m.chat_id,
                Staged::Touch(id, _) => id,
            };
            if !t.chats.iter().any(|c| &c.id == chat_id) {
                return Err(StoreError::CommitFailed(format!(
                    "foreign key violation: chat {chat_id} no longer exists"
                )));
            }
        }

        for op in self.staged {
            match op {
                Staged::Message(m) => t.messages.push(m),
                Staged::Touch(id, at) => {
                    if let Some(chat) = t.chats.iter_mut().find(|c| c.id == id) {
                        chat.touch(at);
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
