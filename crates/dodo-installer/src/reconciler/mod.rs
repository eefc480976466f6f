//! Immediate reconciliation of Flux objects
//!
//! Flux polls the configuration repository on an interval. After a commit
//! the installer asks the reconciler service to act right away, first on the
//! Git source and then on the kustomization built from it.

pub mod client;
pub mod server;

pub use client::{HttpReconcilerClient, Reconciler};
pub use server::{router, serve, FluxObject, KubeReconcileTarget, ReconcileTarget};

/// Annotation Flux watches for on-demand reconciliation
pub const REQUESTED_AT_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";
