//! Central error taxonomy for the registry.
//!
//! Every handler bubbles a `RegistryError`; the `IntoResponse` impl is the
//! single place mapping error categories to HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Reported distinctly from other auth failures so clients can refresh.
    #[error("token expired")]
    TokenExpired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock is held by another owner")]
    LockHeldByOther,

    #[error("{0}")]
    ConcurrencyLimit(String),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
            RegistryError::Auth(_) | RegistryError::TokenExpired => StatusCode::UNAUTHORIZED,
            RegistryError::Forbidden(_) => StatusCode::FORBIDDEN,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::LockHeldByOther => StatusCode::LOCKED,
            RegistryError::ConcurrencyLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            RegistryError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({ "detail": self.to_string() });

        match &self {
            RegistryError::TokenExpired => {
                body["code"] = json!("token_expired");
            }
            RegistryError::Internal(msg) => {
                let correlation_id = Uuid::new_v4().to_string();
                log::error!("internal error [{correlation_id}]: {msg}");
                body = json!({
                    "detail": "internal error",
                    "correlation_id": correlation_id,
                });
            }
            RegistryError::Upstream(msg) => {
                log::warn!("upstream failure: {msg}");
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

impl From<redb::Error> for RegistryError {
    fn from(e: redb::Error) -> Self {
        RegistryError::Internal(format!("storage: {e}"))
    }
}

impl From<redb::DatabaseError> for RegistryError {
    fn from(e: redb::DatabaseError) -> Self {
        RegistryError::Internal(format!("storage: {e}"))
    }
}

impl From<redb::TransactionError> for RegistryError {
    fn from(e: redb::TransactionError) -> Self {
        RegistryError::Internal(format!("storage: {e}"))
    }
}

impl From<redb::TableError> for RegistryError {
    fn from(e: redb::TableError) -> Self {
        RegistryError::Internal(format!("storage: {e}"))
    }
}

impl From<redb::StorageError> for RegistryError {
    fn from(e: redb::StorageError) -> Self {
        RegistryError::Internal(format!("storage: {e}"))
    }
}

impl From<redb::CommitError> for RegistryError {
    fn from(e: redb::CommitError) -> Self {
        RegistryError::Internal(format!("storage: {e}"))
    }
}

impl From<bincode::Error> for RegistryError {
    fn from(e: bincode::Error) -> Self {
        RegistryError::Internal(format!("row encoding: {e}"))
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Internal(format!("json: {e}"))
    }
}
