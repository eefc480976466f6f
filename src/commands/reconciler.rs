//! Reconciler command - serve on-demand Flux reconciliation

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use dodo_installer::reconciler::{self, KubeReconcileTarget};

use super::kube_client;
use crate::Result;

/// Run the Flux reconciler service
#[derive(Args, Debug)]
pub struct ReconcilerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Path to kubeconfig, in-cluster config when absent
    #[arg(short = 'k', long)]
    pub kubeconfig: Option<PathBuf>,
}

pub async fn run(args: ReconcilerArgs) -> Result<()> {
    let client = kube_client(args.kubeconfig.as_ref()).await?;
    reconciler::serve(args.addr, Arc::new(KubeReconcileTarget::new(client))).await?;
    Ok(())
}
