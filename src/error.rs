// src/error.rs
// Central error taxonomy (spec §7). One thiserror enum shared by the store,
// scheduler, and gateway instead of a per-module IntoResponse type per the
// teacher's `api/http/auth.rs` pattern, generalized to the whole service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Input(String),

    #[error("forbidden: {0}")]
    Auth(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("server is shutting down")]
    Shutdown,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already processing")]
    AlreadyProcessing,
}

impl AppError {
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Input(_) => "Input",
            AppError::Auth(_) => "Auth",
            AppError::Conflict(_) => "Conflict",
            AppError::RateLimited { .. } => "RateLimited",
            AppError::Transient(_) => "Transient",
            AppError::ProviderUnavailable(_) => "ProviderUnavailable",
            AppError::Internal(_) => "Internal",
            AppError::Shutdown => "Shutdown",
            AppError::NotFound(_) => "NotFound",
            AppError::AlreadyProcessing => "AlreadyProcessing",
        }
    }

    /// Whether the originating operation may be retried automatically within budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Input(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyProcessing => StatusCode::CONFLICT,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(category = self.category(), "{}", self);
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            code: self.category().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Lifts an `AppError` into the gateway's `error` event shape (spec
    /// §4.9's outbound `error(code, message, discussion_id?)`), the WS
    /// counterpart to `IntoResponse` for the HTTP surface.
    pub fn to_ws_event(&self, discussion_id: Option<uuid::Uuid>) -> crate::gateway::message::WsServerMessage {
        crate::gateway::message::WsServerMessage::Error {
            code: self.category().to_string(),
            message: self.to_string(),
            discussion_id,
        }
    }
}

/// Classifies an arbitrary filesystem/lock-backend failure into the
/// permanent/transient partition used by the store's retry wrapper (spec §4.1).
pub fn classify_io_error(err: &std::io::Error) -> AppError {
    use std::io::ErrorKind::*;
    match err.kind() {
        NotFound => AppError::NotFound(err.to_string()),
        PermissionDenied => AppError::Auth(err.to_string()),
        AlreadyExists | WouldBlock | TimedOut | Interrupted => AppError::Transient(err.to_string()),
        _ => {
            tracing::warn!(kind = ?err.kind(), "unrecognized io error kind, treating as transient");
            AppError::Transient(err.to_string())
        }
    }
}
