//! Mapping of domain errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use docchat_core::error::{AuthError, Error, StoreError, ToolError};
use docchat_ingest::IngestError;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Domain(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Domain(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Domain(e.into())
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::Domain(e.into())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        Self::Domain(e.into())
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Domain(e) => match e {
                Error::Store(StoreError::NotFound { .. } | StoreError::Forbidden { .. }) => StatusCode::NOT_FOUND,
                Error::Store(StoreError::AlreadyExists { .. }) => StatusCode::CONFLICT,
                Error::Auth(_) => StatusCode::UNAUTHORIZED,
                Error::Tool(ToolError::InvalidArguments(_)) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(message) => message.clone(),
            // Someone else's chat looks exactly like a missing one.
            Self::Domain(Error::Store(StoreError::Forbidden { entity, id })) => {
                StoreError::NotFound { entity: *entity, id: id.clone() }.to_string()
            }
            Self::Domain(e) if self.status().is_server_error() => {
                error!(error = %e, "Request failed");
                "Internal server error".into()
            }
            Self::Domain(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorResponse { error: self.message() })).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
