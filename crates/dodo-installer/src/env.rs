//! Environment configuration and the network catalog derived from it

use serde::{Deserialize, Serialize};

/// Path of the environment configuration inside the repository
pub const CONFIG_PATH: &str = "/config.yaml";

/// Name of the always-present public network
pub const PUBLIC_NETWORK: &str = "Public";
/// Name of the network reachable over the VPN, present with a private domain
pub const PRIVATE_NETWORK: &str = "Private";

/// IPs reserved on the load balancer at bootstrap
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedIps {
    /// Address of the Git server hosting the configuration repository
    #[serde(default)]
    pub config_repo: String,
    /// Address of the public ingress
    #[serde(default)]
    pub ingress_public: String,
    /// Address of the DNS server
    #[serde(default)]
    pub dns: String,
    /// First address of the general service pool
    #[serde(default)]
    pub services_from: String,
    /// Last address of the general service pool
    #[serde(default)]
    pub services_to: String,
}

/// Environment configuration stored at [`CONFIG_PATH`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvConfig {
    /// Logical name of the installation
    pub infra_name: String,
    /// Environment id
    #[serde(default)]
    pub id: String,
    /// Prefix of every namespace created for this environment
    #[serde(default)]
    pub namespace_prefix: String,
    /// Operator SSH public key
    #[serde(default)]
    pub admin_public_key: String,
    /// Public addresses of the installation
    #[serde(default)]
    pub public_ip: Vec<String>,
    /// Public domain
    #[serde(default)]
    pub domain: String,
    /// Domain served over the VPN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_domain: Option<String>,
    /// Contact for certificate issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    /// Reserved load balancer addresses
    #[serde(default)]
    pub network: ReservedIps,
}

impl EnvConfig {
    /// Namespace `name` qualified with the environment prefix
    pub fn namespace(&self, name: &str) -> String {
        format!("{}{}", self.namespace_prefix, name)
    }
}

/// A network apps can be exposed on
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Display name, referenced by app input
    pub name: String,
    /// Ingress class serving this network
    pub ingress_class: String,
    /// cert-manager issuer, empty when certificates are not issued
    #[serde(default)]
    pub certificate_issuer: String,
    /// Domain apps get subdomains of
    pub domain: String,
    /// Port allocator endpoint mapping ports
    pub allocate_port_addr: String,
    /// Port allocator endpoint reserving ports
    pub reserve_port_addr: String,
    /// Port allocator endpoint releasing ports
    pub deallocate_port_addr: String,
}

fn port_allocator_addr(ingress: &str, endpoint: &str) -> String {
    format!(
        "http://port-allocator.{}.svc.cluster.local/api/{}",
        ingress, endpoint
    )
}

impl Network {
    fn served_by(
        name: &str,
        ingress: &str,
        certificate_issuer: String,
        domain: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            ingress_class: ingress.to_string(),
            certificate_issuer,
            domain: domain.to_string(),
            allocate_port_addr: port_allocator_addr(ingress, "allocate"),
            reserve_port_addr: port_allocator_addr(ingress, "reserve"),
            deallocate_port_addr: port_allocator_addr(ingress, "remove"),
        }
    }
}

/// Networks of an environment, public first
pub fn create_networks(env: &EnvConfig) -> Vec<Network> {
    let public_ingress = format!("{}-ingress-public", env.infra_name);
    let mut networks = vec![Network::served_by(
        PUBLIC_NETWORK,
        &public_ingress,
        format!("{}-public", env.id),
        &env.domain,
    )];
    if let Some(private_domain) = env.private_domain.as_deref().filter(|d| !d.is_empty()) {
        let private_ingress = format!("{}-ingress-private", env.id);
        networks.push(Network::served_by(
            PRIVATE_NETWORK,
            &private_ingress,
            String::new(),
            private_domain,
        ));
    }
    networks
}

/// Extra network served by the public ingress under another domain
pub fn custom_network(env: &EnvConfig, name: &str, domain: &str) -> Network {
    Network::served_by(
        name,
        &format!("{}-ingress-public", env.infra_name),
        format!("{}-public", env.id),
        domain,
    )
}

/// Look a network up by name
pub fn find_network<'a>(networks: &'a [Network], name: &str) -> Option<&'a Network> {
    networks.iter().find(|n| n.name == name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn env() -> EnvConfig {
        EnvConfig {
            infra_name: "dodo".to_string(),
            id: "lekva".to_string(),
            namespace_prefix: "lekva-".to_string(),
            admin_public_key: "ssh-ed25519 AAAA".to_string(),
            public_ip: vec!["135.181.48.180".to_string()],
            domain: "lekva.me".to_string(),
            private_domain: Some("p.lekva.me".to_string()),
            contact_email: None,
            network: ReservedIps::default(),
        }
    }

    #[test]
    fn public_network_points_at_infra_ingress() {
        let networks = create_networks(&env());
        let public = &networks[0];
        assert_eq!(public.name, "Public");
        assert_eq!(public.ingress_class, "dodo-ingress-public");
        assert_eq!(public.certificate_issuer, "lekva-public");
        assert_eq!(
            public.allocate_port_addr,
            "http://port-allocator.dodo-ingress-public.svc.cluster.local/api/allocate"
        );
        assert_eq!(
            public.deallocate_port_addr,
            "http://port-allocator.dodo-ingress-public.svc.cluster.local/api/remove"
        );
    }

    #[test]
    fn private_network_needs_private_domain() {
        let networks = create_networks(&env());
        let private = find_network(&networks, "Private").expect("private");
        assert_eq!(private.ingress_class, "lekva-ingress-private");
        assert_eq!(private.domain, "p.lekva.me");
        assert!(private.certificate_issuer.is_empty());

        let mut public_only = env();
        public_only.private_domain = None;
        assert_eq!(create_networks(&public_only).len(), 1);
    }

    #[test]
    fn config_reads_camel_case_yaml() {
        let env: EnvConfig = serde_yaml::from_str(
            "infraName: dodo\nid: lekva\nnamespacePrefix: lekva-\nnetwork:\n  configRepo: 10.0.0.2\n",
        )
        .expect("parse");
        assert_eq!(env.network.config_repo, "10.0.0.2");
        assert_eq!(env.namespace("app-vaultwarden"), "lekva-app-vaultwarden");
        assert_eq!(env.private_domain, None);
    }
}
