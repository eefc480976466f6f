//! Common building blocks shared by every dodo crate
//!
//! - [`error`] - Shared error type used by helpers in this crate
//! - [`retry`] - Exponential backoff for transient failures
//! - [`keys`] - ECDSA SSH key pair generation
//! - [`kube_utils`] - Kubernetes client construction, namespaces, polling
//! - [`template`] - `${...}` templating over minijinja
//! - [`yaml`] - Dotted-path access into YAML documents

#![deny(missing_docs)]

pub mod error;
pub mod keys;
pub mod kube_utils;
pub mod retry;
pub mod template;
pub mod yaml;

pub use error::Error;

/// Result type alias using the common Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by dodo
pub const FIELD_MANAGER: &str = "dodo-installer";

/// Annotation carrying a human readable description of a Helm release
pub const INSTALLER_INFO_ANNOTATION: &str = "dodo.cloud/installer-info";

/// Author recorded on every commit made to the configuration repository
pub const COMMIT_AUTHOR: &str = "installer";
