//! Waiting for Helm releases to converge

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use dodo_common::kube_utils::{has_condition, is_not_found};

use crate::error::{Error, Result};
use crate::tasks::{Task, TaskError};
use crate::template::ReleaseRef;

/// Default time between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reports whether a release has converged
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseStatusSource: Send + Sync {
    /// True once the release is ready at its latest revision
    async fn is_ready(&self, release: &ReleaseRef) -> Result<bool>;
}

/// Reads `HelmRelease` status from the cluster
#[derive(Clone)]
pub struct HelmReleaseStatus {
    client: Client,
}

impl HelmReleaseStatus {
    /// Status source on `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_resource() -> ApiResource {
        ApiResource {
            group: "helm.toolkit.fluxcd.io".to_string(),
            version: "v2".to_string(),
            api_version: "helm.toolkit.fluxcd.io/v2".to_string(),
            kind: "HelmRelease".to_string(),
            plural: "helmreleases".to_string(),
        }
    }
}

/// Ready condition set and the applied revision caught up with the attempted one
pub fn release_converged(status: &serde_json::Value) -> bool {
    let applied = status.get("lastAppliedRevision").and_then(|v| v.as_str());
    let attempted = status.get("lastAttemptedRevision").and_then(|v| v.as_str());
    has_condition(status, "Ready") && applied.is_some() && applied == attempted
}

#[async_trait]
impl ReleaseStatusSource for HelmReleaseStatus {
    async fn is_ready(&self, release: &ReleaseRef) -> Result<bool> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &release.namespace, &Self::api_resource());
        match api.get(&release.name).await {
            Ok(obj) => Ok(obj.data.get("status").is_some_and(release_converged)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Polls a [`ReleaseStatusSource`] until releases converge
#[derive(Clone)]
pub struct ReleaseMonitor {
    source: Arc<dyn ReleaseStatusSource>,
    interval: Duration,
    ceiling: Option<Duration>,
    cancel: CancellationToken,
}

impl ReleaseMonitor {
    /// Monitor polling every [`DEFAULT_POLL_INTERVAL`] without a ceiling
    pub fn new(source: Arc<dyn ReleaseStatusSource>) -> Self {
        Self {
            source,
            interval: DEFAULT_POLL_INTERVAL,
            ceiling: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Poll every `interval`
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up with [`Error::NotConverged`] after `ceiling`
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    /// Stop waiting when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait for one release. Errors from the status source count as not
    /// ready yet.
    pub async fn wait_for(&self, release: &ReleaseRef) -> Result<()> {
        let start = Instant::now();
        loop {
            match self.source.is_ready(release).await {
                Ok(true) => {
                    info!(release = %release.key(), "Release converged");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => debug!(release = %release.key(), error = %e, "Status check failed"),
            }
            if let Some(ceiling) = self.ceiling {
                if start.elapsed() >= ceiling {
                    return Err(Error::NotConverged {
                        release: release.key(),
                        elapsed_secs: start.elapsed().as_secs(),
                    });
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("waiting for {}", release.key())));
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Concurrent task with one leaf per release
    pub fn monitor_task(&self, releases: &[ReleaseRef]) -> Task {
        let children = releases
            .iter()
            .map(|release| {
                let monitor = self.clone();
                let release = release.clone();
                Task::leaf(release.info.clone(), move || async move {
                    monitor.wait_for(&release).await.map_err(TaskError::from)
                })
            })
            .collect();
        Task::concurrent("Waiting for apps to start", children)
    }
}
