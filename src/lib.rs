//! dodo CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// dodo - self-hosted personal cloud
#[derive(Parser, Debug)]
#[command(name = "dodo")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the platform into an empty cluster
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Manage app instances in the configuration repository
    #[command(subcommand)]
    App(commands::app::AppCommands),
    /// Run the ingress port allocator
    PortAllocator(commands::port_allocator::PortAllocatorArgs),
    /// Run the DNS zone manager
    DnsApi(commands::dns::DnsApiArgs),
    /// Run the Flux reconciler service
    Reconciler(commands::reconciler::ReconcilerArgs),
    /// Manage the nodes of a k3s cluster
    #[command(subcommand)]
    Cluster(commands::cluster::ClusterCommands),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
            Commands::App(cmd) => commands::app::run(cmd).await,
            Commands::PortAllocator(args) => commands::port_allocator::run(args).await,
            Commands::DnsApi(args) => commands::dns::run(args).await,
            Commands::Reconciler(args) => commands::reconciler::run(args).await,
            Commands::Cluster(cmd) => commands::cluster::run(cmd).await,
        }
    }
}
