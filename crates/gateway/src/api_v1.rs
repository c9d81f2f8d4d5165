//! HTTP API v1.
//!
//! Endpoints (all scoped to the calling user):
//!
//! - `POST   /v1/chats`                 Create a chat
//! - `GET    /v1/chats`                 List chats
//! - `GET    /v1/chats/{id}`            Read a chat
//! - `PATCH  /v1/chats/{id}`            Update title, context, temperature, model
//! - `DELETE /v1/chats/{id}`            Delete a chat with its files and messages
//! - `GET    /v1/chats/{id}/messages`   Paginated messages, newest first
//! - `PUT    /v1/chats/{id}/avatar`     Set the chat's avatar image (base64)
//! - `GET    /v1/chats/{id}/avatar`     The chat's avatar image
//! - `POST   /v1/chats/{id}/files`      Upload (base64 or URL); starts ingestion
//! - `GET    /v1/chats/{id}/files`      Files with index status
//! - `DELETE /v1/files/{id}`            Delete a file and its index entries
//! - `POST   /v1/favourites/{chat_id}`  Favourite a chat
//! - `DELETE /v1/favourites/{chat_id}`  Unfavourite a chat
//! - `GET    /v1/favourites`            List favourites
//! - `POST   /v1/chats/{id}/stream`     Streaming turn (SSE)
//! - `POST   /v1/chats/{id}/complete`   Non-streaming turn

use axum::{
    Extension, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    response::sse::{Event as SseEvent, Sse},
    routing::{delete, get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};

use docchat_agent::{Persisted, RunEnd, TurnRunner};
use docchat_config::AppConfig;
use docchat_core::chat::{Chat, ChatFile, ChatMessage, ChatUpdate, Favourite, Page};
use docchat_core::store::{RelationalStore, get_owned_chat, get_owned_file};
use docchat_core::web::WebFetcher;
use docchat_core::error::StoreError;
use docchat_ingest::{Ingestor, avatar_extension};
use docchat_tools::FileSelection;

use crate::error::{ApiError, ApiResult};

// ── State ─────────────────────────────────────────────────────────────────

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 200;

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn RelationalStore>,
    pub ingestor: Arc<Ingestor>,
    pub turns: TurnRunner,
    /// Fetcher for URL uploads; `None` rejects them.
    pub fetcher: Option<Arc<dyn WebFetcher>>,
}

pub type SharedApiState = Arc<ApiV1State>;

/// The authenticated caller, set by the auth middleware.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/chats", post(create_chat_handler).get(list_chats_handler))
        .route(
            "/chats/{id}",
            get(get_chat_handler).patch(update_chat_handler).delete(delete_chat_handler),
        )
        .route("/chats/{id}/messages", get(list_messages_handler))
        .route("/chats/{id}/avatar", get(get_avatar_handler).put(put_avatar_handler))
        .route("/chats/{id}/files", post(upload_file_handler).get(list_files_handler))
        .route("/chats/{id}/stream", post(stream_turn_handler))
        .route("/chats/{id}/complete", post(complete_turn_handler))
        .route("/files/{id}", delete(delete_file_handler))
        .route("/favourites", get(list_favourites_handler))
        .route(
            "/favourites/{chat_id}",
            post(add_favourite_handler).delete(remove_favourite_handler),
        )
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateChatRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "first_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub size: usize,
}

fn first_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// A file upload: either inline content or a URL to fetch.
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub content_base64: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvatarRequest {
    pub mime_type: String,
    pub content_base64: String,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    /// Per-file choices; omitted means every eligible file with plain retrieval.
    #[serde(default)]
    pub files: Option<Vec<FileSelection>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    pub answer: String,
    pub end: RunEnd,
    pub persisted: bool,
}

// ── Chats ─────────────────────────────────────────────────────────────────

fn check_temperature(temperature: Option<f32>) -> ApiResult<()> {
    match temperature {
        Some(t) if !(0.0..=2.0).contains(&t) => Err(ApiError::bad_request("temperature must be between 0.0 and 2.0")),
        _ => Ok(()),
    }
}

async fn create_chat_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<CreateChatRequest>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    check_temperature(payload.temperature)?;
    let title = payload
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New chat".into());
    let mut chat = Chat::new(&user, title);
    chat.context = payload.context;
    chat.temperature = payload.temperature;
    chat.model = payload.model;

    let chat = state.store.create_chat(chat).await?;
    info!(chat_id = %chat.id, "Chat created");
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn list_chats_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<Vec<Chat>>> {
    Ok(Json(state.store.list_chats(&user).await?))
}

async fn get_chat_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(get_owned_chat(state.store.as_ref(), &id, &user).await?))
}

async fn update_chat_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(update): Json<ChatUpdate>,
) -> ApiResult<Json<Chat>> {
    check_temperature(update.temperature)?;
    let mut chat = get_owned_chat(state.store.as_ref(), &id, &user).await?;
    chat.apply(update);
    state.store.update_chat(&chat).await?;
    Ok(Json(chat))
}

async fn delete_chat_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    get_owned_chat(state.store.as_ref(), &id, &user).await?;
    state.ingestor.delete_chat(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Page<ChatMessage>>> {
    get_owned_chat(state.store.as_ref(), &id, &user).await?;
    let size = params.size.clamp(1, MAX_PAGE_SIZE);
    Ok(Json(state.store.list_messages(&id, params.page.max(1), size).await?))
}

async fn put_avatar_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(payload): Json<AvatarRequest>,
) -> ApiResult<Json<Chat>> {
    let mut chat = get_owned_chat(state.store.as_ref(), &id, &user).await?;
    if avatar_extension(&payload.mime_type).is_none() {
        return Err(ApiError::bad_request("avatar must be a PNG, JPEG, GIF or WebP image"));
    }
    let bytes = STANDARD
        .decode(payload.content_base64.trim())
        .map_err(|e| ApiError::bad_request(format!("content_base64 is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("avatar must not be empty"));
    }
    state.ingestor.store_avatar(&mut chat, &payload.mime_type, &bytes).await?;
    Ok(Json(chat))
}

async fn get_avatar_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let chat = get_owned_chat(state.store.as_ref(), &id, &user).await?;
    match state.ingestor.read_avatar(&chat).await? {
        Some((bytes, content_type)) => Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response()),
        None => Err(StoreError::NotFound { entity: "avatar", id }.into()),
    }
}

// ── Files ─────────────────────────────────────────────────────────────────

async fn upload_file_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(payload): Json<UploadRequest>,
) -> ApiResult<(StatusCode, Json<ChatFile>)> {
    get_owned_chat(state.store.as_ref(), &id, &user).await?;

    let file = match (payload.content_base64, payload.url) {
        (Some(content), None) => {
            let file_name = payload
                .file_name
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| ApiError::bad_request("file_name is required"))?;
            let mime_type = payload
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".into());
            let bytes = STANDARD
                .decode(content.trim())
                .map_err(|e| ApiError::bad_request(format!("content_base64 is not valid base64: {e}")))?;
            state
                .ingestor
                .store_upload(&id, &file_name, &mime_type, &bytes)
                .await?
        }
        (None, Some(url)) => {
            let fetcher = state
                .fetcher
                .as_ref()
                .ok_or_else(|| ApiError::bad_request("URL uploads are not enabled"))?;
            let page = fetcher.fetch(&url).await.map_err(|e| {
                warn!(chat_id = %id, url = %url, error = %e, "URL upload fetch failed");
                ApiError::bad_request(format!("could not fetch {url}"))
            })?;
            state.ingestor.store_web_page(&id, &page).await?
        }
        _ => {
            return Err(ApiError::bad_request(
                "provide exactly one of content_base64 or url",
            ));
        }
    };

    // Status moves from pending to done/failed on the stored record.
    state.ingestor.spawn(file.clone());
    Ok((StatusCode::ACCEPTED, Json(file)))
}

async fn list_files_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ChatFile>>> {
    get_owned_chat(state.store.as_ref(), &id, &user).await?;
    Ok(Json(state.store.list_files(&id).await?))
}

async fn delete_file_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    get_owned_file(state.store.as_ref(), &id, &user).await?;
    state.ingestor.delete_file(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Favourites ────────────────────────────────────────────────────────────

async fn add_favourite_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Favourite>> {
    get_owned_chat(state.store.as_ref(), &chat_id, &user).await?;
    Ok(Json(state.store.add_favourite(&user, &chat_id).await?))
}

async fn remove_favourite_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(chat_id): Path<String>,
) -> ApiResult<StatusCode> {
    match state.store.remove_favourite(&user, &chat_id).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(StoreError::NotFound {
            entity: "favourite",
            id: chat_id,
        }
        .into()),
    }
}

async fn list_favourites_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<Vec<Favourite>>> {
    Ok(Json(state.store.list_favourites(&user).await?))
}

// ── Turns ─────────────────────────────────────────────────────────────────

fn check_message(message: &str) -> ApiResult<()> {
    if message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    Ok(())
}

/// `POST /v1/chats/{id}/stream`: one `data: {json}` frame per delta, then one
/// terminal `{"status":"done"}` or `{"error":...}` frame.
async fn stream_turn_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(payload): Json<TurnRequest>,
) -> ApiResult<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>> {
    check_message(&payload.message)?;
    let chat = get_owned_chat(state.store.as_ref(), &id, &user).await?;
    info!(chat_id = %chat.id, "Streaming turn requested");

    let events = state
        .turns
        .stream(&chat, &payload.message, payload.files.as_deref())
        .await?;
    let stream = events.map(|event| Ok(SseEvent::default().data(event.to_json().to_string())));
    Ok(Sse::new(stream))
}

async fn complete_turn_handler(
    State(state): State<SharedApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(payload): Json<TurnRequest>,
) -> ApiResult<Json<TurnResponse>> {
    check_message(&payload.message)?;
    let chat = get_owned_chat(state.store.as_ref(), &id, &user).await?;
    let answer = state
        .turns
        .complete(&chat, &payload.message, payload.files.as_deref())
        .await?;
    Ok(Json(TurnResponse {
        answer: answer.text,
        end: answer.end,
        persisted: answer.persisted == Persisted::Committed,
    }))
}
