//! k3s installation commands
//!
//! Every node runs k3s with its bundled ingress, storage and service load
//! balancer disabled; those come from the platform's own charts. Pods use
//! `10.45.0.0/16`, services `10.46.0.0/16`, and flannel runs over vxlan.

use std::net::IpAddr;

use tracing::info;

use crate::error::Result;
use crate::ssh::RemoteShell;

/// API server port
pub const API_SERVER_PORT: u16 = 6443;
/// Pod network
pub const CLUSTER_CIDR: &str = "10.45.0.0/16";
/// Service network
pub const SERVICE_CIDR: &str = "10.46.0.0/16";

const INSTALL_SCRIPT: &str = "curl -sfL https://get.k3s.io | sh -s -";
const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";
const NODE_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";
const LOCAL_SERVER: &str = "server: https://127.0.0.1:6443";

fn server_flags() -> String {
    format!(
        "--disable traefik --disable local-storage --disable servicelb \
         --kube-proxy-arg proxy-mode=ipvs --kube-proxy-arg ipvs-strict-arp \
         --flannel-backend vxlan --cluster-cidr={} --service-cidr={}",
        CLUSTER_CIDR, SERVICE_CIDR
    )
}

/// First control plane node
pub fn init_command() -> String {
    format!("{} --cluster-init {}", INSTALL_SCRIPT, server_flags())
}

/// Additional control plane node
pub fn join_server_command(server_addr: &str, token: &str) -> String {
    format!(
        "{} server --server=https://{} --token={} {}",
        INSTALL_SCRIPT,
        server_addr,
        token,
        server_flags()
    )
}

/// Agent node
pub fn join_agent_command(server_addr: &str, token: &str) -> String {
    format!(
        "{} agent --server=https://{} --token={}",
        INSTALL_SCRIPT, server_addr, token
    )
}

/// Node role, which decides the uninstall script
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Control plane
    Server,
    /// Worker
    Agent,
}

impl Role {
    fn uninstall_script(self) -> &'static str {
        match self {
            Self::Server => "k3s-uninstall.sh",
            Self::Agent => "k3s-agent-uninstall.sh",
        }
    }
}

/// Install k3s unless the node already has it
pub async fn install(shell: &dyn RemoteShell, command: &str) -> Result<()> {
    if shell.exec("which k3s").await.is_ok() {
        info!("k3s already installed");
        return Ok(());
    }
    info!("Installing k3s");
    shell.exec(command).await?;
    Ok(())
}

/// Run the uninstall script if it is present
pub async fn uninstall(shell: &dyn RemoteShell, role: Role) -> Result<()> {
    let script = role.uninstall_script();
    if shell.exec(&format!("which {}", script)).await.is_err() {
        return Ok(());
    }
    info!(script, "Uninstalling k3s");
    shell.exec(script).await?;
    Ok(())
}

/// Machine hostname
pub async fn hostname(shell: &dyn RemoteShell) -> Result<String> {
    Ok(shell.exec("hostname").await?.trim().to_string())
}

/// Admin kubeconfig, pointed at `node_ip` instead of loopback
pub async fn kubeconfig(shell: &dyn RemoteShell, node_ip: IpAddr) -> Result<String> {
    let raw = shell.exec(&format!("sudo cat {}", KUBECONFIG_PATH)).await?;
    Ok(raw.replacen(
        LOCAL_SERVER,
        &format!("server: https://{}", api_server_addr(node_ip)),
        1,
    ))
}

/// Token other nodes join with
pub async fn server_token(shell: &dyn RemoteShell) -> Result<String> {
    Ok(shell
        .exec(&format!("sudo cat {}", NODE_TOKEN_PATH))
        .await?
        .trim()
        .to_string())
}

/// `ip:6443`, bracketed for IPv6
pub fn api_server_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, API_SERVER_PORT),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, API_SERVER_PORT),
    }
}
