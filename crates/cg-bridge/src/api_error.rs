//! HTTP API error types.
//!
//! `ApiError` maps session-layer failures onto status codes and renders them
//! as `{"error": "..."}` bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use cg_session::SessionError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The container runtime cannot be reached.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => ApiError::NotFound(format!("Session {id} not found")),
            SessionError::ShellNotFound(id) => ApiError::NotFound(format!("Shell {id} not found")),
            SessionError::ProcessNotFound(pid) => {
                ApiError::NotFound(format!("Process {pid} not found"))
            }
            SessionError::ShellDead(id) => ApiError::NotFound(format!("Shell {id} has exited")),
            SessionError::RuntimeUnavailable(msg) => ApiError::ServiceUnavailable(msg),
            SessionError::Exec(msg) => ApiError::BadRequest(msg),
            SessionError::FileNotFound(path) => ApiError::NotFound(format!("File {path} not found")),
            SessionError::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalError(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(json!({ "error": error_message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
