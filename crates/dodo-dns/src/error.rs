//! Error types for the zone manager

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type for zone operations
pub type Result<T> = std::result::Result<T, Error>;

/// Zone manager error, mapped onto an HTTP status by [`IntoResponse`]
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The record to delete does not exist
    #[error("record not found: {0}")]
    NotFound(String),

    /// The zone file could not be parsed
    #[error("zone file line {line}: {message}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What is wrong with it
        message: String,
    },

    /// Key generation or encoding failed
    #[error("dnssec error: {0}")]
    Crypto(String),

    /// The zone manager answered a client with an error status
    #[error("zone manager returned {status}: {body}")]
    Upstream {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a parse error at `line`
    pub fn parse(line: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: msg.into(),
        }
    }

    /// HTTP status this error is reported with
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Zone request failed");
        }
        (status, self.to_string()).into_response()
    }
}
