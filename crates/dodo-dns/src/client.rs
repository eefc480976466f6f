//! Client side of the zone API, as used by the ACME DNS-01 challenge solver
//!
//! The solver learns where the zone manager lives from a config map with
//! `createTXTAddr` and `deleteTXTAddr` entries, and its own identity from
//! the `API_GROUP_NAME` and `RESOLVER_NAME` environment variables.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::server::RecordRequest;

/// Environment variable naming the solver's API group
pub const API_GROUP_NAME_ENV: &str = "API_GROUP_NAME";
/// Environment variable naming the solver
pub const RESOLVER_NAME_ENV: &str = "RESOLVER_NAME";

const CREATE_ADDR_KEY: &str = "createTXTAddr";
const DELETE_ADDR_KEY: &str = "deleteTXTAddr";

/// Identity of the challenge solver webhook
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolverConfig {
    /// API group the webhook registers under
    pub group_name: String,
    /// Solver name referenced by issuers
    pub resolver_name: String,
}

impl SolverConfig {
    /// Read both variables from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::invalid(format!("{} must be specified", key)))
        };
        Ok(Self {
            group_name: required(API_GROUP_NAME_ENV)?,
            resolver_name: required(RESOLVER_NAME_ENV)?,
        })
    }
}

/// Split a resolved FQDN into `(domain, entry)` relative to its zone.
/// Both arguments carry a trailing dot.
pub fn split_fqdn(resolved_fqdn: &str, resolved_zone: &str) -> (String, String) {
    let entry = resolved_fqdn
        .strip_suffix(resolved_zone)
        .unwrap_or(resolved_fqdn)
        .trim_end_matches('.');
    let domain = resolved_zone.trim_end_matches('.');
    (domain.to_string(), entry.to_string())
}

/// Posts TXT record changes to the zone manager
#[derive(Clone, Debug)]
pub struct ZoneClient {
    http: reqwest::Client,
    create_addr: String,
    delete_addr: String,
}

impl ZoneClient {
    /// Client posting to the given endpoints
    pub fn new(create_addr: impl Into<String>, delete_addr: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            create_addr: create_addr.into(),
            delete_addr: delete_addr.into(),
        }
    }

    /// Client for the endpoints listed in config map `data`
    pub fn from_config_map(data: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            data.get(key)
                .cloned()
                .ok_or_else(|| Error::invalid(format!("{} missing from api config", key)))
        };
        Ok(Self::new(get(CREATE_ADDR_KEY)?, get(DELETE_ADDR_KEY)?))
    }

    /// Present a challenge value for `fqdn` in `zone`
    pub async fn present(&self, fqdn: &str, zone: &str, key: &str) -> Result<()> {
        let (domain, entry) = split_fqdn(fqdn, zone);
        self.post(&self.create_addr, RecordRequest { domain, entry, text: key.to_string() })
            .await
    }

    /// Remove the challenge value for `fqdn`; other values of the same name stay
    pub async fn clean_up(&self, fqdn: &str, zone: &str, key: &str) -> Result<()> {
        let (domain, entry) = split_fqdn(fqdn, zone);
        self.post(&self.delete_addr, RecordRequest { domain, entry, text: key.to_string() })
            .await
    }

    async fn post(&self, addr: &str, req: RecordRequest) -> Result<()> {
        debug!(addr, entry = %req.entry, "Posting TXT record change");
        let response = self.http.post(addr).json(&req).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::manager::tests::manager;
    use crate::server::router;

    #[test]
    fn entry_is_fqdn_minus_zone() {
        assert_eq!(
            split_fqdn("_acme-challenge.app.lekva.me.", "lekva.me."),
            ("lekva.me".to_string(), "_acme-challenge.app".to_string())
        );
    }

    #[test]
    fn solver_config_requires_both_variables() {
        let config = SolverConfig::from_lookup(|key| match key {
            API_GROUP_NAME_ENV => Some("dodo.cloud".into()),
            RESOLVER_NAME_ENV => Some("dns-zone-manager".into()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.resolver_name, "dns-zone-manager");

        let missing = SolverConfig::from_lookup(|key| {
            (key == API_GROUP_NAME_ENV).then(|| "dodo.cloud".to_string())
        });
        assert!(missing.is_err());
    }

    #[test]
    fn config_map_needs_both_addresses() {
        let mut data = BTreeMap::new();
        data.insert(CREATE_ADDR_KEY.to_string(), "http://dns/create-txt-record".to_string());
        assert!(ZoneClient::from_config_map(&data).is_err());
        data.insert(DELETE_ADDR_KEY.to_string(), "http://dns/delete-txt-record".to_string());
        assert!(ZoneClient::from_config_map(&data).is_ok());
    }

    #[tokio::test]
    async fn present_and_clean_up_against_live_server() {
        let (_dir, m) = manager();
        let m = Arc::new(m);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(m.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = ZoneClient::new(
            format!("http://{}/create-txt-record", addr),
            format!("http://{}/delete-txt-record", addr),
        );
        client
            .present("_acme-challenge.app.lekva.me.", "lekva.me.", "k1")
            .await
            .expect("present");
        client
            .present("_acme-challenge.app.lekva.me.", "lekva.me.", "k2")
            .await
            .expect("present second");
        client
            .clean_up("_acme-challenge.app.lekva.me.", "lekva.me.", "k1")
            .await
            .expect("clean up");

        let zone = m.read().expect("zone");
        let values: Vec<String> = zone
            .txt_records("_acme-challenge.app.lekva.me.")
            .filter_map(|r| r.txt_value())
            .collect();
        assert_eq!(values, vec!["k2".to_string()]);
    }
}
