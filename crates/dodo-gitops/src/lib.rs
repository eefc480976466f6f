//! GitOps plumbing for dodo
//!
//! The configuration repository is the single source of truth. This crate
//! owns every path into it:
//!
//! - [`store`] - [`RepoStore`], the serialized pull/modify/commit/push primitive
//! - [`fs`] - [`RepoFs`], typed file access inside the working tree
//! - [`backend`] - libgit2 and in-memory version control backends
//! - [`kustomization`] - `kustomization.yaml` documents and parent chains
//! - [`soft`] - administration of the soft-serve Git server

#![deny(missing_docs)]

pub mod backend;
pub mod error;
pub mod fs;
pub mod kustomization;
pub mod soft;
pub mod store;

pub use backend::{Git2Backend, GitAuth, GitBackend, LocalBackend, PushOptions, DEFAULT_BRANCH};
pub use error::{Error, Result};
pub use fs::RepoFs;
pub use kustomization::Kustomization;
pub use soft::{GitServer, Permission, SoftServeClient};
pub use store::{DoOptions, RepoStore};
