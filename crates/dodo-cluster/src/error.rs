//! Error types for cluster management

use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while growing or shrinking a cluster
#[derive(Debug, Error)]
pub enum Error {
    /// `init` was called on a cluster that already has a control plane
    #[error("cluster is already initialized")]
    AlreadyInitialized,

    /// A node was added before `init`
    #[error("cluster is not initialized")]
    NotInitialized,

    /// A node with the same address is already part of the cluster
    #[error("server {0} already exists")]
    AlreadyExists(String),

    /// No node with this name
    #[error("server {0} not found")]
    NotFound(String),

    /// A remote command exited unsuccessfully
    #[error("command `{command}` on {host} failed: {message}")]
    Command {
        /// Host the command ran on
        host: String,
        /// The command line
        command: String,
        /// stderr of the command
        message: String,
    },

    /// Kubernetes API failure
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Shared helper failure (client construction, polling)
    #[error(transparent)]
    Common(#[from] dodo_common::Error),

    /// State (de)serialization failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid server description
    #[error("invalid server: {0}")]
    InvalidServer(String),
}

impl Error {
    /// Create a remote command failure
    pub fn command(
        host: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Command {
            host: host.into(),
            command: command.into(),
            message: message.into(),
        }
    }
}
