use crate::queue::QueueError;
use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Client-visible failures of the HTTP surface. Everything else is logged
/// and collapsed into a 5xx.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("model not allowed: {0}")]
    ModelNotAllowed(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("queue unavailable")]
    QueueUnavailable,
    #[error("storage unavailable")]
    StorageUnavailable,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::ModelNotAllowed(_) => "model_not_allowed",
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::QueueUnavailable => "queue_unavailable",
            ApiError::StorageUnavailable => "storage_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::ModelNotAllowed(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::QueueUnavailable | ApiError::StorageUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::InvalidParent(why) => ApiError::InvalidRequest(why),
            StoreError::RoleConflict(why) => ApiError::InvalidRequest(why),
            StoreError::ChatClosed(id) => ApiError::InvalidRequest(format!("chat {id} is hidden")),
            StoreError::AlreadyFinalized { message_id, state } => ApiError::InvalidRequest(
                format!("message {message_id} already finalized as {}", state.as_str()),
            ),
            StoreError::InvalidTransition { .. } => {
                ApiError::InvalidRequest(err.to_string())
            }
            // Invariant breach or backend loss: log loudly, surface a 503.
            StoreError::ConcurrencyViolation(id) => {
                tracing::error!("concurrency violation on message {id}");
                ApiError::StorageUnavailable
            }
            StoreError::Sqlx(e) => {
                tracing::error!("storage error: {e:?}");
                ApiError::StorageUnavailable
            }
            StoreError::Serde(e) => {
                tracing::error!("storage serialization error: {e:?}");
                ApiError::StorageUnavailable
            }
            StoreError::Corrupt(what) => {
                tracing::error!("corrupt storage row: {what}");
                ApiError::StorageUnavailable
            }
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        tracing::error!("broker error: {err:?}");
        ApiError::QueueUnavailable
    }
}
