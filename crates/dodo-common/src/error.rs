//! Error types for shared helpers
//!
//! Errors carry the context in which they happened so that log lines from
//! different components stay readable once they are bubbled up.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Error type for the common helpers
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Key material could not be generated or encoded
    #[error("key generation error: {0}")]
    KeyGeneration(String),

    /// A document did not have the expected shape
    #[error("invalid document at {path}: {message}")]
    InvalidDocument {
        /// Dotted path of the offending field
        path: String,
        /// Description of what's wrong
        message: String,
    },

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A polling loop ran out of time
    #[error("timed out after {elapsed_secs}s: {message}")]
    Timeout {
        /// Seconds spent before giving up
        elapsed_secs: u64,
        /// What was being waited for
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a key generation error
    pub fn key_generation(msg: impl Into<String>) -> Self {
        Self::KeyGeneration(msg.into())
    }

    /// Create an invalid-document error for a dotted path
    pub fn invalid_document(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidDocument {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}
