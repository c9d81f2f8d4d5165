//! Relational store traits: CRUD over chats, files, messages and favourites.
//!
//! Reads and single-row writes go straight through [`RelationalStore`]. Multi-row
//! writes that must land together (a user/assistant message pair plus the chat's
//! last-interaction stamp) go through a [`StoreSession`] and become visible only on
//! `commit`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chat::{Chat, ChatFile, ChatMessage, Favourite, Page};
use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait RelationalStore: Send + Sync {
    fn name(&self) -> &str;

    // --- chats ---

    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat>;

    async fn get_chat(&self, id: &str) -> StoreResult<Option<Chat>>;

    /// Chats owned by `user_id`, most recently updated first.
    async fn list_chats(&self, user_id: &str) -> StoreResult<Vec<Chat>>;

    async fn update_chat(&self, chat: &Chat) -> StoreResult<()>;

    /// Delete a chat together with its messages, files and favourites.
    ///
    /// Returns the removed files so the caller can drop their external index entries.
    async fn delete_chat(&self, id: &str) -> StoreResult<Vec<ChatFile>>;

    // --- files ---

    /// Attach a file. Fails with `AlreadyExists` when the chat already has a file
    /// with the same name.
    async fn add_file(&self, file: ChatFile) -> StoreResult<ChatFile>;

    async fn get_file(&self, id: &str) -> StoreResult<Option<ChatFile>>;

    /// Files of one chat in upload order.
    async fn list_files(&self, chat_id: &str) -> StoreResult<Vec<ChatFile>>;

    async fn update_file(&self, file: &ChatFile) -> StoreResult<()>;

    async fn delete_file(&self, id: &str) -> StoreResult<Option<ChatFile>>;

    // --- messages ---

    /// The most recent `limit` messages of a chat, returned oldest first.
    async fn recent_messages(&self, chat_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>>;

    /// One page of messages, newest first. `page` is 1-based.
    async fn list_messages(&self, chat_id: &str, page: usize, size: usize) -> StoreResult<Page<ChatMessage>>;

    async fn count_messages(&self, chat_id: &str) -> StoreResult<usize>;

    // --- favourites ---

    /// Favourite a chat. Favouriting twice returns the existing record.
    async fn add_favourite(&self, user_id: &str, chat_id: &str) -> StoreResult<Favourite>;

    async fn remove_favourite(&self, user_id: &str, chat_id: &str) -> StoreResult<Option<Favourite>>;

    async fn list_favourites(&self, user_id: &str) -> StoreResult<Vec<Favourite>>;

    // --- unit of work ---

    /// Open a transactional session.
    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>>;
}

/// A transactional session. Nothing written through it is visible until `commit`.
#[async_trait]
pub trait StoreSession: Send {
    async fn get_chat(&mut self, id: &str) -> StoreResult<Option<Chat>>;

    async fn append_message(&mut self, message: ChatMessage) -> StoreResult<()>;

    /// Set the chat's last-interaction timestamp.
    async fn touch_chat(&mut self, chat_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Load a chat and check that `user_id` owns it.
pub async fn get_owned_chat(
    store: &dyn RelationalStore,
    chat_id: &str,
    user_id: &str,
) -> StoreResult<Chat> {
    let chat = store
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| StoreError::chat_not_found(chat_id))?;
    chat.ensure_owner(user_id)?;
    Ok(chat)
}

/// Load a file and check that `user_id` owns the chat it belongs to.
pub async fn get_owned_file(
    store: &dyn RelationalStore,
    file_id: &str,
    user_id: &str,
) -> StoreResult<ChatFile> {
    let file = store
        .get_file(file_id)
        .await?
        .ok_or_else(|| StoreError::file_not_found(file_id))?;
    get_owned_chat(store, &file.chat_id, user_id).await?;
    Ok(file)
}
