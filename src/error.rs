//! Error taxonomy for the sandbox orchestrator.
//!
//! Four kinds: validation, not-found, runtime (recoverable container/store
//! failures), and internal. The HTTP layer never sees a raw `bollard` or
//! `sqlx` error — only its message text, logged in full at the error site.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

impl From<bollard::errors::Error> for DaemonError {
    fn from(e: bollard::errors::Error) -> Self {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                DaemonError::NotFound(e.to_string())
            }
            _ => DaemonError::Runtime(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for DaemonError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => DaemonError::NotFound("record not found".into()),
            _ => DaemonError::Runtime(e.to_string()),
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DaemonError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            DaemonError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            DaemonError::Runtime(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            DaemonError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        tracing::error!(error = %self, "request failed");

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
