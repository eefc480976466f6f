//! Error types for the port allocator

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type for allocator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Allocator error, mapped onto an HTTP status by [`IntoResponse`]
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request (unknown protocol, reserved port number)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Secret does not match the one recorded for the port
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No mapping exists for the requested port
    #[error("not found: {0}")]
    NotFound(String),

    /// Port is already mapped or reserved
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration repository failure
    #[error("repository error: {0}")]
    Repo(#[from] dodo_gitops::Error),

    /// The ingress release does not have the expected shape
    #[error(transparent)]
    Document(#[from] dodo_common::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// HTTP status this error is reported with
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Repo(_) | Self::Document(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Port allocator request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
