//! Error taxonomy shared by every component.
//!
//! Each component maps its native failures into [`ApiError`] at its
//! boundary; the axum layer renders the variant as an HTTP status with a
//! structured `{detail}` body. Server-side failures (5xx) carry a generated
//! correlation id that is returned to the client and logged, never a stack
//! trace.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

/// Marker for a storage query that exceeded its deadline.
#[derive(Debug, thiserror::Error)]
#[error("query deadline exceeded")]
pub struct DeadlineExceeded;

/// Application-level error, mapped 1:1 onto the wire taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed input, out-of-range coordinates, missing fields. 400.
    #[error("{0}")]
    Validation(String),

    /// Missing, expired, or malformed credentials. 401.
    #[error("invalid or expired credentials")]
    Unauthorized,

    /// Authenticated but insufficient role. 403.
    #[error("insufficient permissions")]
    Forbidden,

    /// Resource missing or access denied; one code to prevent enumeration. 404.
    #[error("resource not found")]
    NotFound,

    /// Uniqueness violation or invalid state transition. 409.
    #[error("{0}")]
    Conflict(String),

    /// Database or broker unavailable; the client should retry. 503.
    #[error("service temporarily unavailable")]
    Transient(String),

    /// Invariant violation or unclassified failure. 500.
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl ApiError {
    /// Classify an internal failure, pulling transient database conditions
    /// out of the opaque error chain so clients get a retryable 503.
    pub fn from_internal(err: anyhow::Error) -> Self {
        if err.downcast_ref::<DeadlineExceeded>().is_some() {
            return Self::Transient("query deadline exceeded".into());
        }
        if let Some(db) = err.downcast_ref::<sqlx::Error>() {
            match db {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                    return Self::Transient("database unavailable".into());
                }
                _ => {}
            }
        }
        Self::Internal(err)
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            let correlation_id = Uuid::new_v4();
            match &self {
                Self::Internal(source) => tracing::error!(
                    %correlation_id,
                    kind = self.kind(),
                    error = %source,
                    "request failed"
                ),
                other => tracing::error!(
                    %correlation_id,
                    kind = other.kind(),
                    "request failed"
                ),
            }
            let body = json!({
                "detail": self.to_string(),
                "correlation_id": correlation_id,
            });
            return (status, Json(body)).into_response();
        }

        // Client errors are expected traffic; log at INFO at most
        tracing::info!(kind = self.kind(), detail = %self, "request rejected");
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Shorthand used throughout the HTTP layer.
pub type ApiResult<T> = Result<T, ApiError>;
