//! Error types for the installer
//!
//! Template evaluation errors carry the dotted path of the offending input
//! field so that a failed install can point at what to fix. Every one of
//! them is raised before the configuration repository is touched.

use thiserror::Error;

/// Result type for installer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Installer error
#[derive(Debug, Error)]
pub enum Error {
    /// Input does not match the app schema or violates a constraint
    #[error("schema violation at {path}: {message}")]
    SchemaViolation {
        /// Dotted path of the input field
        path: String,
        /// What is wrong with it
        message: String,
    },

    /// A network field names a network the environment does not have
    #[error("unknown network {name} at {path}")]
    UnknownNetwork {
        /// Dotted path of the input field
        path: String,
        /// Requested network name
        name: String,
    },

    /// A derived value depends on input that is missing
    #[error("unresolved dependency at {path}: {message}")]
    UnresolvedDependency {
        /// Dotted path of the derived field
        path: String,
        /// What could not be resolved
        message: String,
    },

    /// A resource template failed to render or did not produce valid YAML
    #[error("failed to render {path}: {message}")]
    Render {
        /// Resource path relative to the app directory
        path: String,
        /// Renderer or parser message
        message: String,
    },

    /// Two rendered documents describe the same object
    #[error("duplicate resource {kind} {namespace}/{name}")]
    DuplicateResource {
        /// Object kind
        kind: String,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
    },

    /// An app package is malformed
    #[error("invalid app package {slug}: {message}")]
    InvalidPackage {
        /// App slug or package directory
        slug: String,
        /// What is wrong with it
        message: String,
    },

    /// No app template with this slug
    #[error("app not found: {0}")]
    AppNotFound(String),

    /// No installed instance with this id
    #[error("app instance not found: {0}")]
    InstanceNotFound(String),

    /// A release did not become ready in time
    #[error("release {release} did not converge within {elapsed_secs}s")]
    NotConverged {
        /// `namespace/name` of the release
        release: String,
        /// Seconds waited
        elapsed_secs: u64,
    },

    /// The operation was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A cooperating service answered with an error status
    #[error("{service} returned {status}: {body}")]
    Upstream {
        /// Which service was called
        service: String,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// An external command exited unsuccessfully
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Command line that was run
        command: String,
        /// stderr of the command
        message: String,
    },

    /// Configuration repository failure
    #[error("repository error: {0}")]
    Repo(#[from] dodo_gitops::Error),

    /// Shared helper failure
    #[error(transparent)]
    Common(#[from] dodo_common::Error),

    /// Kubernetes API failure
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// YAML (de)serialization failure
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

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
    /// Create a schema violation
    pub fn schema(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaViolation {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an unresolved dependency error
    pub fn unresolved(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UnresolvedDependency {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a render error
    pub fn render(path: impl Into<String>, msg: impl ToString) -> Self {
        Self::Render {
            path: path.into(),
            message: msg.to_string(),
        }
    }

    /// Create an invalid package error
    pub fn invalid_package(slug: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidPackage {
            slug: slug.into(),
            message: msg.into(),
        }
    }

    /// Create a command failure
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for errors raised while evaluating a template against input
    pub fn is_template_error(&self) -> bool {
        matches!(
            self,
            Self::SchemaViolation { .. }
                | Self::UnknownNetwork { .. }
                | Self::UnresolvedDependency { .. }
                | Self::Render { .. }
                | Self::DuplicateResource { .. }
        )
    }
}
