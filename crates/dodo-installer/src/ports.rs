//! Client of the ingress port allocators

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use dodo_port_allocator::{AllocateRequest, PortResponse, RemoveRequest, ReserveRequest};

use crate::error::{Error, Result};

/// Talks to the allocator of a network, addressed per call
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PortAllocatorClient: Send + Sync {
    /// Hold a port until it is allocated
    async fn reserve(&self, addr: &str, req: &ReserveRequest) -> Result<PortResponse>;

    /// Map a port to a service
    async fn allocate(&self, addr: &str, req: &AllocateRequest) -> Result<PortResponse>;

    /// Drop a mapping
    async fn deallocate(&self, addr: &str, req: &RemoveRequest) -> Result<()>;
}

/// [`PortAllocatorClient`] over HTTP
#[derive(Clone, Debug, Default)]
pub struct HttpPortAllocatorClient {
    http: reqwest::Client,
}

impl HttpPortAllocatorClient {
    /// New client
    pub fn new() -> Self {
        Self::default()
    }

    async fn post<B: Serialize + Sync>(&self, addr: &str, body: &B) -> Result<reqwest::Response> {
        let response = self.http.post(addr).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(Error::Upstream {
            service: "port-allocator".to_string(),
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn post_json<B, T>(&self, addr: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        Ok(self.post(addr, body).await?.json().await?)
    }
}

#[async_trait]
impl PortAllocatorClient for HttpPortAllocatorClient {
    async fn reserve(&self, addr: &str, req: &ReserveRequest) -> Result<PortResponse> {
        let resp: PortResponse = self.post_json(addr, req).await?;
        debug!(addr = %addr, port = resp.port, "Reserved port");
        Ok(resp)
    }

    async fn allocate(&self, addr: &str, req: &AllocateRequest) -> Result<PortResponse> {
        let resp: PortResponse = self.post_json(addr, req).await?;
        debug!(addr = %addr, port = resp.port, dest = %req.destination(), "Allocated port");
        Ok(resp)
    }

    async fn deallocate(&self, addr: &str, req: &RemoveRequest) -> Result<()> {
        self.post(addr, req).await?;
        debug!(addr = %addr, port = req.source_port, "Deallocated port");
        Ok(())
    }
}
