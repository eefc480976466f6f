//! Persisted description of a cluster and its nodes

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// A machine reachable over SSH
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Hostname, filled in from the machine on first connect
    #[serde(default)]
    pub name: String,
    /// Address used for SSH and for the API server
    pub ip: IpAddr,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Expected host key in `authorized_keys` format; unchecked when empty
    #[serde(default)]
    pub host_key: String,
    /// Login user
    pub user: String,
    /// Login password, used when there is no client key
    #[serde(default)]
    pub password: String,
    /// PEM private key to log in with
    #[serde(default)]
    pub client_key: String,
    /// VPN pre-auth key of the node
    #[serde(default)]
    pub auth_key: String,
}

impl Server {
    /// Server at `ip` logged into as `user`
    pub fn new(ip: IpAddr, user: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            ip,
            port: DEFAULT_SSH_PORT,
            host_key: String::new(),
            user: user.into(),
            password: String::new(),
            client_key: String::new(),
            auth_key: String::new(),
        }
    }
}

/// Everything known about a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Cluster name
    pub name: String,
    /// Ingress class of the cluster's ingress controller
    #[serde(default)]
    pub ingress_class_name: String,
    /// Address the ingress controller answers on
    #[serde(default, rename = "ingressIP")]
    pub ingress_ip: Option<IpAddr>,
    /// `host:6443` of the first control plane node
    #[serde(default)]
    pub server_addr: String,
    /// k3s join token
    #[serde(default)]
    pub server_token: String,
    /// Admin kubeconfig document
    #[serde(default)]
    pub kubeconfig: String,
    /// Control plane nodes
    #[serde(default)]
    pub controllers: Vec<Server>,
    /// Agent nodes
    #[serde(default)]
    pub workers: Vec<Server>,
    /// Whether distributed storage has been installed
    #[serde(default)]
    pub storage_enabled: bool,
}

impl ClusterState {
    /// Empty state of a new cluster
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// True once a control plane node has been set up
    pub fn is_initialized(&self) -> bool {
        !self.kubeconfig.is_empty()
    }

    /// Node with address `ip`, controller or worker
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<&Server> {
        self.controllers
            .iter()
            .chain(self.workers.iter())
            .find(|s| s.ip == ip)
    }

    /// Read state written by [`ClusterState::save`]
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Write the state as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_uses_camel_case_keys() {
        let mut state = ClusterState::new("home");
        state.ingress_ip = Some("10.0.0.5".parse().expect("ip"));
        state.controllers.push(Server::new("10.0.0.1".parse().expect("ip"), "root"));
        let json = serde_json::to_value(&state).expect("json");
        for key in [
            "name",
            "ingressClassName",
            "ingressIP",
            "serverAddr",
            "serverToken",
            "kubeconfig",
            "controllers",
            "workers",
            "storageEnabled",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["controllers"][0]["clientKey"], "");
    }

    #[test]
    fn save_and_load_agree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cluster.json");
        let mut state = ClusterState::new("home");
        state.kubeconfig = "apiVersion: v1".into();
        state.workers.push(Server::new("10.0.0.2".parse().expect("ip"), "root"));
        state.save(&path).expect("save");
        let loaded = ClusterState::load(&path).expect("load");
        assert_eq!(loaded, state);
        assert!(loaded.is_initialized());
        assert!(loaded.find_by_ip("10.0.0.2".parse().expect("ip")).is_some());
    }

    #[test]
    fn servers_default_to_port_22() {
        let server: Server =
            serde_json::from_str(r#"{"ip": "10.0.0.3", "user": "root"}"#).expect("server");
        assert_eq!(server.port, 22);
    }
}
