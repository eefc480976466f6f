//! k3s cluster management for dodo
//!
//! Brings up the first control plane node of a cluster, joins further
//! controllers and workers, and removes nodes again, all over SSH. The
//! cluster description is kept as a JSON state file.

#![deny(missing_docs)]

pub mod drain;
pub mod error;
pub mod k3s;
pub mod manager;
pub mod ssh;
pub mod state;

pub use drain::{KubeNodeDrainer, NodeDrainer};
pub use error::{Error, Result};
pub use manager::{ClusterManager, IngressSetup};
pub use ssh::{RemoteShell, ShellConnector, SshConnector};
pub use state::{ClusterState, Server};
