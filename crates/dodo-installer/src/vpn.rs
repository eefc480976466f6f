//! VPN pre-authentication keys issued by the headscale controller

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Issues and revokes mesh VPN credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VpnKeyIssuer: Send + Sync {
    /// New pre-authentication key for `username`
    async fn generate_auth_key(&self, username: &str) -> Result<String>;

    /// Revoke a pre-authentication key
    async fn expire_key(&self, username: &str, key: &str) -> Result<()>;

    /// Force a node to re-authenticate
    async fn expire_node(&self, username: &str, node: &str) -> Result<()>;

    /// Forget a node
    async fn remove_node(&self, username: &str, node: &str) -> Result<()>;
}

/// HTTP client of the headscale controller API
#[derive(Clone, Debug)]
pub struct HeadscaleClient {
    http: reqwest::Client,
    api_addr: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExpireKeyRequest<'a> {
    auth_key: &'a str,
}

impl HeadscaleClient {
    /// Client for the API at `api_addr`
    pub fn new(api_addr: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_addr: api_addr.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_addr, path)
    }

    async fn check(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Upstream {
                service: "headscale".to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl VpnKeyIssuer for HeadscaleClient {
    async fn generate_auth_key(&self, username: &str) -> Result<String> {
        debug!(user = %username, "Requesting VPN pre-auth key");
        let response = self
            .http
            .post(self.url(&format!("/user/{}/preauthkey", username)))
            .send()
            .await?;
        Ok(Self::check(response).await?.trim().to_string())
    }

    async fn expire_key(&self, username: &str, key: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/user/{}/preauthkey", username)))
            .json(&ExpireKeyRequest { auth_key: key })
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn expire_node(&self, username: &str, node: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/user/{}/node/{}/expire", username, node)))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn remove_node(&self, username: &str, node: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/user/{}/node/{}", username, node)))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }
}
