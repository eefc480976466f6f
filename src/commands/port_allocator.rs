//! Port allocator command - serve ingress port allocations

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use dodo_port_allocator::{AllocatorConfig, PortAllocator};

use super::RepoArgs;
use crate::Result;

/// Run the ingress port allocator
#[derive(Args, Debug)]
pub struct PortAllocatorArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Path of the ingress HelmRelease inside the repository
    #[arg(long)]
    pub ingress_path: String,

    /// Ports kept open ahead of allocation
    #[arg(long)]
    pub min_pre_open_ports: Option<usize>,

    #[command(flatten)]
    pub repo: RepoArgs,
}

pub async fn run(args: PortAllocatorArgs) -> Result<()> {
    let repo = args.repo.open()?;
    let mut config = AllocatorConfig::new(&args.ingress_path);
    if let Some(min) = args.min_pre_open_ports {
        config.min_pre_open_ports = min;
    }
    let allocator = Arc::new(PortAllocator::new(repo, config));

    let pre_open = Arc::clone(&allocator);
    tokio::task::spawn_blocking(move || pre_open.ensure_pre_open_ports())
        .await
        .map_err(|e| crate::Error::command_failed(format!("pre-opening ports: {}", e)))??;
    info!(ingress = %args.ingress_path, "Pre-open ports ensured");

    dodo_port_allocator::serve(args.addr, allocator).await?;
    Ok(())
}
