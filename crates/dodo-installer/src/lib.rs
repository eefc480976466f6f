//! App lifecycle for dodo
//!
//! - [`template`] - app packages evaluated against user input
//! - [`repository`] - catalog of app packages
//! - [`manager`] - installs, updates and removes app instances in the
//!   configuration repository
//! - [`monitor`] - waits for Helm releases to converge
//! - [`tasks`] - observable task trees for long-running operations
//! - [`bootstrap`] - first-time installation into an empty cluster
//! - [`reconciler`] - forces Flux to pick up new commits

#![deny(missing_docs)]

pub mod bootstrap;
pub mod env;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod namespace;
pub mod ports;
pub mod reconciler;
pub mod repository;
pub mod tasks;
pub mod template;
pub mod vpn;

pub use env::{EnvConfig, Network};
pub use error::{Error, Result};
pub use manager::{AppInstanceConfig, AppManager, InstallOptions, ReleaseResources};
pub use monitor::{HelmReleaseStatus, ReleaseMonitor, ReleaseStatusSource};
pub use namespace::{KubeNamespaceCreator, NamespaceCreator};
pub use repository::AppRepository;
pub use tasks::{Status, Task, TaskError};
pub use template::{AppTemplate, TemplateEvaluator};
