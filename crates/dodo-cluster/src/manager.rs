//! Cluster node set management
//!
//! The manager owns the [`ClusterState`] behind one async mutex, so adding
//! and removing nodes against the same cluster never interleave. Each
//! operation connects to the node over SSH, runs the k3s scripts, and only
//! records the node once the remote side succeeded.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::drain::NodeDrainer;
use crate::error::{Error, Result};
use crate::k3s::{self, Role};
use crate::ssh::{RemoteShell, ShellConnector};
use crate::state::{ClusterState, Server};

/// Ingress class every new cluster starts with
pub const DEFAULT_INGRESS_CLASS: &str = "default";

/// Installs the ingress controller of a freshly initialised cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressSetup: Send + Sync {
    /// Set up ingress for cluster `name`; returns the ingress address
    async fn setup(&self, name: &str, kubeconfig: &str, ingress_class: &str) -> Result<IpAddr>;
}

/// Grows and shrinks one cluster
pub struct ClusterManager {
    state: Mutex<ClusterState>,
    connector: Arc<dyn ShellConnector>,
    drainer: Arc<dyn NodeDrainer>,
}

impl ClusterManager {
    /// Manager of an empty cluster called `name`
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn ShellConnector>,
        drainer: Arc<dyn NodeDrainer>,
    ) -> Self {
        Self::restore(ClusterState::new(name), connector, drainer)
    }

    /// Manager continuing from saved `state`
    pub fn restore(
        state: ClusterState,
        connector: Arc<dyn ShellConnector>,
        drainer: Arc<dyn NodeDrainer>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            connector,
            drainer,
        }
    }

    /// Manager continuing from the state file at `path`
    pub fn load(
        path: &Path,
        connector: Arc<dyn ShellConnector>,
        drainer: Arc<dyn NodeDrainer>,
    ) -> Result<Self> {
        Ok(Self::restore(ClusterState::load(path)?, connector, drainer))
    }

    /// Snapshot of the current state
    pub async fn state(&self) -> ClusterState {
        self.state.lock().await.clone()
    }

    /// Write the current state to `path`
    pub async fn save(&self, path: &Path) -> Result<()> {
        self.state.lock().await.save(path)
    }

    /// Record that distributed storage is installed
    pub async fn enable_storage(&self) {
        self.state.lock().await.storage_enabled = true;
    }

    async fn connect(&self, server: &mut Server) -> Result<Arc<dyn RemoteShell>> {
        let shell = self.connector.connect(server).await?;
        server.name = k3s::hostname(shell.as_ref()).await?;
        Ok(shell)
    }

    /// Turn `server` into the first control plane node
    #[instrument(skip_all, fields(ip = %server.ip))]
    pub async fn init(&self, mut server: Server, ingress: &dyn IngressSetup) -> Result<IpAddr> {
        let mut state = self.state.lock().await;
        if state.is_initialized() {
            return Err(Error::AlreadyInitialized);
        }
        let shell = self.connect(&mut server).await?;
        k3s::install(shell.as_ref(), &k3s::init_command()).await?;
        let kubeconfig = k3s::kubeconfig(shell.as_ref(), server.ip).await?;
        let token = k3s::server_token(shell.as_ref()).await?;
        let ingress_ip = ingress
            .setup(&state.name, &kubeconfig, DEFAULT_INGRESS_CLASS)
            .await?;

        state.server_addr = k3s::api_server_addr(server.ip);
        state.server_token = token;
        state.kubeconfig = kubeconfig;
        state.ingress_class_name = DEFAULT_INGRESS_CLASS.to_string();
        state.ingress_ip = Some(ingress_ip);
        info!(node = %server.name, %ingress_ip, "Cluster initialized");
        state.controllers = vec![server];
        Ok(ingress_ip)
    }

    /// Add a control plane node
    #[instrument(skip_all, fields(ip = %server.ip))]
    pub async fn join_controller(&self, server: Server) -> Result<()> {
        self.join(server, Role::Server).await
    }

    /// Add an agent node
    #[instrument(skip_all, fields(ip = %server.ip))]
    pub async fn join_worker(&self, server: Server) -> Result<()> {
        self.join(server, Role::Agent).await
    }

    async fn join(&self, mut server: Server, role: Role) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if state.find_by_ip(server.ip).is_some() {
            return Err(Error::AlreadyExists(server.ip.to_string()));
        }
        let shell = self.connect(&mut server).await?;
        let command = match role {
            Role::Server => k3s::join_server_command(&state.server_addr, &state.server_token),
            Role::Agent => k3s::join_agent_command(&state.server_addr, &state.server_token),
        };
        k3s::install(shell.as_ref(), &command).await?;
        info!(node = %server.name, ?role, "Node joined");
        match role {
            Role::Server => state.controllers.push(server),
            Role::Agent => state.workers.push(server),
        }
        Ok(())
    }

    /// Drain, delete and uninstall node `name`
    #[instrument(skip(self))]
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let (role, index) = if let Some(i) = state.controllers.iter().position(|s| s.name == name) {
            (Role::Server, i)
        } else if let Some(i) = state.workers.iter().position(|s| s.name == name) {
            (Role::Agent, i)
        } else {
            return Err(Error::NotFound(name.to_string()));
        };

        self.drainer.drain_and_delete(&state.kubeconfig, name).await?;
        let mut server = match role {
            Role::Server => state.controllers[index].clone(),
            Role::Agent => state.workers[index].clone(),
        };
        let shell = self.connect(&mut server).await?;
        k3s::uninstall(shell.as_ref(), role).await?;
        match role {
            Role::Server => state.controllers.remove(index),
            Role::Agent => state.workers.remove(index),
        };
        info!(node = %name, "Node removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::MockNodeDrainer;
    use crate::ssh::MockShellConnector;
    use parking_lot::Mutex as SyncMutex;

    /// Node answering the handful of commands the manager issues
    struct FakeNode {
        hostname: String,
        k3s_installed: bool,
        log: Arc<SyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl RemoteShell for FakeNode {
        async fn exec(&self, command: &str) -> Result<String> {
            self.log.lock().push(format!("{}: {}", self.hostname, command));
            match command {
                "hostname" => Ok(format!("{}\n", self.hostname)),
                "which k3s" if !self.k3s_installed => {
                    Err(Error::command(&self.hostname, command, "not found"))
                }
                c if c.starts_with("sudo cat /etc/rancher") => {
                    Ok("server: https://127.0.0.1:6443\n".to_string())
                }
                c if c.starts_with("sudo cat /var/lib/rancher") => Ok("K10token\n".to_string()),
                _ => Ok(String::new()),
            }
        }
    }

    fn connector(log: Arc<SyncMutex<Vec<String>>>) -> Arc<dyn ShellConnector> {
        let mut connector = MockShellConnector::new();
        connector.expect_connect().returning(move |server: &Server| {
            let hostname = match server.ip.to_string().as_str() {
                "10.0.0.1" => "cp1",
                "10.0.0.2" => "cp2",
                _ => "worker",
            };
            let shell: Arc<dyn RemoteShell> = Arc::new(FakeNode {
                hostname: hostname.to_string(),
                k3s_installed: false,
                log: log.clone(),
            });
            Ok(shell)
        });
        Arc::new(connector)
    }

    fn server(ip: &str) -> Server {
        Server::new(ip.parse().expect("ip"), "root")
    }

    fn ingress() -> MockIngressSetup {
        let mut ingress = MockIngressSetup::new();
        ingress
            .expect_setup()
            .withf(|name: &str, kubeconfig: &str, class: &str| {
                name == "home" && kubeconfig.contains("10.0.0.1:6443") && class == "default"
            })
            .returning(|_, _, _| Ok("10.0.0.100".parse().expect("ip")));
        ingress
    }

    fn drainer() -> Arc<dyn NodeDrainer> {
        let mut drainer = MockNodeDrainer::new();
        drainer.expect_drain_and_delete().returning(|_, _| Ok(()));
        Arc::new(drainer)
    }

    #[tokio::test]
    async fn init_records_control_plane() {
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let manager = ClusterManager::new("home", connector(log.clone()), drainer());
        let ip = manager.init(server("10.0.0.1"), &ingress()).await.expect("init");
        assert_eq!(ip.to_string(), "10.0.0.100");

        let state = manager.state().await;
        assert_eq!(state.server_addr, "10.0.0.1:6443");
        assert_eq!(state.server_token, "K10token");
        assert_eq!(state.ingress_class_name, "default");
        assert_eq!(state.controllers[0].name, "cp1");
        assert!(log.lock().iter().any(|c| c.contains("--cluster-init")));

        let again = manager.init(server("10.0.0.2"), &ingress()).await;
        assert!(matches!(again, Err(Error::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn joins_need_an_initialized_cluster_and_unique_addresses() {
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let manager = ClusterManager::new("home", connector(log.clone()), drainer());
        assert!(matches!(
            manager.join_worker(server("10.0.0.3")).await,
            Err(Error::NotInitialized)
        ));

        manager.init(server("10.0.0.1"), &ingress()).await.expect("init");
        manager.join_controller(server("10.0.0.2")).await.expect("controller");
        manager.join_worker(server("10.0.0.3")).await.expect("worker");
        assert!(matches!(
            manager.join_worker(server("10.0.0.3")).await,
            Err(Error::AlreadyExists(_))
        ));

        let state = manager.state().await;
        assert_eq!(state.controllers.len(), 2);
        assert_eq!(state.workers.len(), 1);
        let log = log.lock();
        assert!(log
            .iter()
            .any(|c| c.starts_with("cp2: ") && c.contains("server --server=https://10.0.0.1:6443 --token=K10token")));
        assert!(log
            .iter()
            .any(|c| c.starts_with("worker: ") && c.contains("agent --server=https://10.0.0.1:6443")));
    }

    #[tokio::test]
    async fn remove_drains_then_uninstalls() {
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let mut drain = MockNodeDrainer::new();
        drain
            .expect_drain_and_delete()
            .withf(|_: &str, name: &str| name == "worker")
            .times(1)
            .returning(|_, _| Ok(()));
        let manager = ClusterManager::new("home", connector(log.clone()), Arc::new(drain));
        manager.init(server("10.0.0.1"), &ingress()).await.expect("init");
        manager.join_worker(server("10.0.0.3")).await.expect("worker");

        manager.remove_server("worker").await.expect("remove");
        assert!(manager.state().await.workers.is_empty());
        assert!(log
            .lock()
            .iter()
            .any(|c| c == "worker: k3s-agent-uninstall.sh"));

        assert!(matches!(
            manager.remove_server("worker").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn state_survives_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cluster.json");
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let manager = ClusterManager::new("home", connector(log.clone()), drainer());
        manager.init(server("10.0.0.1"), &ingress()).await.expect("init");
        manager.enable_storage().await;
        manager.save(&path).await.expect("save");

        let restored = ClusterManager::load(&path, connector(log), drainer()).expect("load");
        let state = restored.state().await;
        assert!(state.storage_enabled);
        assert_eq!(state, manager.state().await);
    }
}
