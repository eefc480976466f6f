//! DNS API command - serve the zone manager

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use dodo_dns::{ZoneConfig, ZoneManager};

use crate::Result;

/// Run the DNS zone manager
#[derive(Args, Debug)]
pub struct DnsApiArgs {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Directory holding the zone, the keys and the CoreDNS snippet
    #[arg(long)]
    pub root_dir: PathBuf,

    /// CoreDNS snippet file name
    #[arg(long, default_value = "coredns.conf")]
    pub config: String,

    /// Zone file name
    #[arg(long, default_value = "zone.db")]
    pub db: String,

    /// Zone to serve
    #[arg(long)]
    pub zone: String,

    /// Public ingress addresses, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub public_ip: Vec<Ipv4Addr>,

    /// Private ingress address
    #[arg(long)]
    pub private_ip: Option<Ipv4Addr>,

    /// Nameserver addresses, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub nameserver_ip: Vec<Ipv4Addr>,
}

impl From<DnsApiArgs> for ZoneConfig {
    fn from(args: DnsApiArgs) -> Self {
        ZoneConfig {
            root_dir: args.root_dir,
            config_file: args.config,
            db_file: args.db,
            zone: args.zone,
            public_ips: args.public_ip,
            private_ip: args.private_ip,
            nameserver_ips: args.nameserver_ip,
        }
    }
}

pub async fn run(args: DnsApiArgs) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let config = ZoneConfig::from(args);
    let zone = config.zone.clone();
    let manager = tokio::task::spawn_blocking(move || ZoneManager::open(config))
        .await
        .map_err(|e| crate::Error::command_failed(format!("opening zone: {}", e)))??;
    info!(%zone, "Zone ready");

    dodo_dns::serve(addr, Arc::new(manager)).await?;
    Ok(())
}
