//! Error types for repository access

use std::path::PathBuf;

use thiserror::Error;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the repo store, its backends and the Git server client
#[derive(Debug, Error)]
pub enum Error {
    /// libgit2 failure (transport, object database, index)
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// Working tree I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML document could not be (de)serialized
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON document could not be (de)serialized
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A path tried to leave the working tree
    #[error("path escapes repository root: {path}")]
    PathEscape {
        /// Offending path as given by the caller
        path: String,
    },

    /// Requested file does not exist in the working tree
    #[error("not found: {}", path.display())]
    NotFound {
        /// Path relative to the working tree
        path: PathBuf,
    },

    /// Local and remote histories have diverged; fast-forward impossible
    #[error("branch {branch} has diverged from origin")]
    Diverged {
        /// Local branch name
        branch: String,
    },

    /// The remote refused a reference update
    #[error("push of {reference} rejected: {message}")]
    PushRejected {
        /// Reference that was rejected
        reference: String,
        /// Reason reported by the remote
        message: String,
    },

    /// A Git server command exited unsuccessfully
    #[error("git server command `{command}` failed: {message}")]
    Command {
        /// The command that was sent
        command: String,
        /// stderr of the failed command
        message: String,
    },

    /// Blocking task panicked or was cancelled
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for a working tree path
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a command failure
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// True when the error means "the file/dir was not there"
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
