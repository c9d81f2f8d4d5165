//! HTTP API gateway for docchat.
//!
//! Exposes a health check and the v1 API: chats, messages, files, favourites,
//! and chat turns (streaming over SSE or one-shot).
//!
//! Built on Axum. Every `/v1` request is tied to a user by the configured
//! [`UserResolver`] before it reaches a handler.

pub mod api_v1;
pub mod auth;
pub mod error;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, header},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use docchat_agent::{TurnRunner, WebAccess};
use docchat_config::AppConfig;
use docchat_core::auth::{Credentials, UserResolver};
use docchat_core::error::Error;
use docchat_core::store::RelationalStore;
use docchat_core::vector::VectorStore;
use docchat_core::web::WebFetcher;
use docchat_ingest::Ingestor;
use docchat_memory::{DocumentIndexer, SqliteVectorStore};
use docchat_store::SqliteStore;
use docchat_tools::{DuckDuckGoSearcher, HttpWebFetcher, SqlServers, SqlxServers};

pub use api_v1::{ApiV1State, CurrentUser, SharedApiState};
pub use auth::{ChainedResolver, HeaderUserResolver, SessionTokenResolver, resolver_from_config};
pub use error::{ApiError, ErrorResponse};

/// State of the auth middleware.
#[derive(Clone)]
struct AuthState {
    users: Arc<dyn UserResolver>,
}

/// Build the full router.
///
/// Layers applied:
/// - user resolution on all /v1 routes
/// - request body size limit (`gateway.max_body_bytes`)
/// - CORS for the local web client
/// - HTTP trace logging
pub fn build_router(api_state: SharedApiState, users: Arc<dyn UserResolver>) -> Router {
    let max_body = api_state.config.gateway.max_body_bytes;
    let v1 = api_v1::v1_router(api_state).layer(middleware::from_fn_with_state(AuthState { users }, auth_middleware));

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::exact(
            header::HeaderValue::from_static("http://localhost:3000"),
        ))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", v1)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Open every backing service named by `config` and wire the API state.
pub async fn build_state(config: Arc<AppConfig>) -> Result<SharedApiState, Error> {
    let llm = docchat_providers::build_provider(&config.llm)?;
    let store: Arc<dyn RelationalStore> = Arc::new(SqliteStore::new(&config.database.url).await?);
    let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(&config.database.vector_url).await?);
    let indexer = Arc::new(DocumentIndexer::new(
        Arc::clone(&llm),
        vectors,
        config.llm.embed_model.clone(),
    ));
    let sql: Arc<dyn SqlServers> = Arc::new(SqlxServers::new(
        config.database.postgres.clone(),
        config.database.mysql.clone(),
    ));
    let fetcher: Arc<dyn WebFetcher> = Arc::new(HttpWebFetcher::new(&config.web)?);
    let searcher = Arc::new(DuckDuckGoSearcher::new(&config.web)?);

    let ingestor = Arc::new(Ingestor::new(
        &config.ingest,
        Arc::clone(&store),
        Arc::clone(&indexer),
        Arc::clone(&sql),
    ));
    let turns = TurnRunner::new(Arc::clone(&config), Arc::clone(&store), llm, indexer)
        .with_sql(sql)
        .with_web(WebAccess {
            fetcher: Arc::clone(&fetcher),
            searcher,
        });

    Ok(Arc::new(ApiV1State {
        config,
        store,
        ingestor,
        turns,
        fetcher: Some(fetcher),
    }))
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let users = resolver_from_config(&config.gateway)?;
    let state = build_state(Arc::new(config)).await?;
    let app = build_router(state, users);

    info!(addr = %addr, "Gateway starting with v1 API");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn credentials(headers: &HeaderMap) -> Credentials {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    let user_header = headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Credentials { bearer, user_header }
}

/// Resolve the caller and attach it to the request as [`CurrentUser`].
async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    match auth.users.resolve(&credentials(req.headers())) {
        Ok(user) => {
            req.extensions_mut().insert(CurrentUser(user));
            next.run(req).await
        }
        Err(e) => {
            debug!(path = %req.uri().path(), error = %e, "Unauthenticated request to /v1 API");
            ApiError::from(e).into_response()
        }
    }
}
