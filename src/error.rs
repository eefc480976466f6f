//! Error types for the dodo binary

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Installer(#[from] dodo_installer::Error),

    #[error(transparent)]
    Repo(#[from] dodo_gitops::Error),

    #[error(transparent)]
    PortAllocator(#[from] dodo_port_allocator::Error),

    #[error(transparent)]
    Dns(#[from] dodo_dns::Error),

    #[error(transparent)]
    Cluster(#[from] dodo_cluster::Error),

    #[error(transparent)]
    Common(#[from] dodo_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}
