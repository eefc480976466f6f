//! Bootstrap command - install the platform into an empty cluster
//!
//! Usage: dodo bootstrap --env-name <name> --public-ip <ip> --charts-dir <dir> \
//!     --admin-pub-key <file> --from-ip <ip> --to-ip <ip>
//!
//! The `--from-ip`..`--to-ip` range is handed to the load balancer. Its first
//! three addresses are pinned to the Git server, the public ingress and the
//! DNS server; the rest become the general service pool.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::{error, info};

use dodo_installer::bootstrap::{
    BootstrapConfig, Bootstrapper, HelmChartInstaller, SoftServeConnector,
};
use dodo_installer::env::ReservedIps;
use dodo_installer::KubeNamespaceCreator;

use super::{app_repository, kube_client, report_progress};
use crate::{Error, Result};

/// Addresses pinned at the start of the range
const PINNED_ADDRESSES: u32 = 3;

/// Install the platform into an empty cluster
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Infrastructure name; the namespace everything lands in
    #[arg(long)]
    pub env_name: String,

    /// Public IP of the cluster, repeatable or comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub public_ip: Vec<String>,

    /// Directory holding the bootstrap charts
    #[arg(long)]
    pub charts_dir: PathBuf,

    /// Operator's SSH public key file
    #[arg(long)]
    pub admin_pub_key: PathBuf,

    /// Host path for block storage data
    #[arg(long, default_value = "/dodo-storage")]
    pub storage_dir: String,

    /// Replicas of every block storage volume
    #[arg(long, default_value_t = 1)]
    pub volume_default_replica_count: u32,

    /// First address handed to the load balancer
    #[arg(long)]
    pub from_ip: Ipv4Addr,

    /// Last address handed to the load balancer
    #[arg(long)]
    pub to_ip: Ipv4Addr,

    /// Prefix of every infrastructure namespace, defaults to `<env-name>-`
    #[arg(long)]
    pub namespace_prefix: Option<String>,

    /// Certificate contact address
    #[arg(long, default_value = "")]
    pub contact_email: String,

    /// Scratch directory for the repository clone and generated keys
    #[arg(long, default_value = "/tmp/dodo-bootstrap")]
    pub workdir: PathBuf,

    /// Extra app packages on top of the embedded catalog
    #[arg(long)]
    pub apps_dir: Option<PathBuf>,

    /// Path to kubeconfig, inferred from the environment when absent
    #[arg(short = 'k', long)]
    pub kubeconfig: Option<PathBuf>,
}

impl BootstrapArgs {
    fn config(&self) -> Result<BootstrapConfig> {
        let admin_public_key = std::fs::read_to_string(&self.admin_pub_key)?
            .trim()
            .to_string();
        if admin_public_key.is_empty() {
            return Err(Error::validation(format!(
                "{} is empty",
                self.admin_pub_key.display()
            )));
        }
        Ok(BootstrapConfig {
            infra_name: self.env_name.clone(),
            public_ip: self.public_ip.clone(),
            namespace_prefix: self
                .namespace_prefix
                .clone()
                .unwrap_or_else(|| format!("{}-", self.env_name)),
            admin_public_key,
            storage_dir: self.storage_dir.clone(),
            volume_default_replica_count: self.volume_default_replica_count,
            contact_email: self.contact_email.clone(),
            service_ips: reserved_ips(self.from_ip, self.to_ip)?,
        })
    }
}

/// Split `from..=to` into the pinned addresses and the service pool
pub fn reserved_ips(from: Ipv4Addr, to: Ipv4Addr) -> Result<ReservedIps> {
    let (start, end) = (u32::from(from), u32::from(to));
    if end < start || end - start < PINNED_ADDRESSES {
        return Err(Error::validation(format!(
            "{}..{} needs at least {} addresses",
            from,
            to,
            PINNED_ADDRESSES + 1
        )));
    }
    let nth = |n: u32| Ipv4Addr::from(start + n).to_string();
    Ok(ReservedIps {
        config_repo: nth(0),
        ingress_public: nth(1),
        dns: nth(2),
        services_from: nth(PINNED_ADDRESSES),
        services_to: to.to_string(),
    })
}

pub async fn run(args: BootstrapArgs) -> Result<()> {
    let config = args.config()?;
    std::fs::create_dir_all(&args.workdir)?;

    let client = kube_client(args.kubeconfig.as_ref()).await?;
    let apps = Arc::new(app_repository(args.apps_dir.as_ref())?);
    let bootstrapper = Bootstrapper::new(
        Arc::new(HelmChartInstaller::new(&args.charts_dir)),
        Arc::new(KubeNamespaceCreator::new(client)),
        Arc::new(SoftServeConnector::new(args.workdir.join("keys"))),
        apps,
        args.workdir.join("config"),
    );

    info!(env = %config.infra_name, "Bootstrapping");
    let run = bootstrapper.prepare(config);
    report_progress(run.task());
    match run.run().await {
        Ok(()) => {
            info!("Bootstrap complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Bootstrap failed");
            Err(Error::command_failed(e.to_string()))
        }
    }
}
