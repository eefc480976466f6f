//! Client side of the reconciler service

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Triggers reconciliation; failures are logged, never returned
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Reconcile the Git source and the kustomization `namespace/name`
    async fn reconcile(&self, namespace: &str, name: &str);
}

/// Upper bound on a single reconciliation request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Reconciler`] over the reconciler service HTTP API
#[derive(Clone, Debug)]
pub struct HttpReconcilerClient {
    http: reqwest::Client,
    base: String,
}

impl HttpReconcilerClient {
    /// Client of the service at `base`
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: http_client(REQUEST_TIMEOUT),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Give up on each request after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = http_client(timeout);
        self
    }

    fn source_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/source/git/{}/{}/reconcile", self.base, namespace, name)
    }

    fn kustomization_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/kustomization/{}/{}/reconcile", self.base, namespace, name)
    }

    async fn trigger(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %url, "Reconciliation triggered");
                true
            }
            Ok(resp) => {
                warn!(url = %url, status = %resp.status(), "Reconciliation request rejected");
                false
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Reconciliation request failed");
                false
            }
        }
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build reconciler HTTP client, using defaults");
            reqwest::Client::new()
        })
}

#[async_trait]
impl Reconciler for HttpReconcilerClient {
    async fn reconcile(&self, namespace: &str, name: &str) {
        if self.trigger(&self.source_url(namespace, name)).await {
            self.trigger(&self.kustomization_url(namespace, name)).await;
        }
    }
}
