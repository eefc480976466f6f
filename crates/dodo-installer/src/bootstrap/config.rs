use serde::{Deserialize, Serialize};

use crate::env::{EnvConfig, ReservedIps};

/// Where the bootstrap configuration is stored in the repository
pub const BOOTSTRAP_CONFIG_PATH: &str = "/bootstrap-config.yaml";

/// Inputs of a bootstrap run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Infrastructure name; also the namespace everything lands in
    pub infra_name: String,
    /// Public IPs of the cluster
    pub public_ip: Vec<String>,
    /// Prefix of every namespace the infrastructure creates
    pub namespace_prefix: String,
    /// Operator's long-term public key
    pub admin_public_key: String,
    /// Host path for block storage data
    pub storage_dir: String,
    /// Replicas of every block storage volume
    pub volume_default_replica_count: u32,
    /// Certificate contact address
    #[serde(default)]
    pub contact_email: String,
    /// Addresses handed to the load balancer
    pub service_ips: ReservedIps,
}

impl BootstrapConfig {
    /// Namespace of an infra app
    pub fn namespace(&self, name: &str) -> String {
        format!("{}{}", self.namespace_prefix, name)
    }

    /// Environment record the infrastructure is rendered against
    pub fn infra_env(&self) -> EnvConfig {
        EnvConfig {
            infra_name: self.infra_name.clone(),
            id: self.infra_name.clone(),
            namespace_prefix: self.namespace_prefix.clone(),
            admin_public_key: self.admin_public_key.clone(),
            public_ip: self.public_ip.clone(),
            domain: String::new(),
            private_domain: None,
            contact_email: Some(self.contact_email.clone()).filter(|e| !e.is_empty()),
            network: self.service_ips.clone(),
        }
    }
}
