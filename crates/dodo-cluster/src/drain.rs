//! Taking nodes out of a cluster through the Kubernetes API

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use dodo_common::kube_utils::{create_client_from_yaml, is_not_found, poll_until};

use crate::error::Result;

/// How long evicted pods get to go away
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Cordons, drains and deletes nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeDrainer: Send + Sync {
    /// Remove node `name` from the cluster reachable with `kubeconfig`
    async fn drain_and_delete(&self, kubeconfig: &str, name: &str) -> Result<()>;
}

/// [`NodeDrainer`] using the eviction API
#[derive(Clone, Debug)]
pub struct KubeNodeDrainer {
    timeout: Duration,
}

impl Default for KubeNodeDrainer {
    fn default() -> Self {
        Self {
            timeout: DRAIN_TIMEOUT,
        }
    }
}

impl KubeNodeDrainer {
    /// Drainer waiting up to `timeout` for pods to leave
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Pods a drain has to evict: not DaemonSet-managed and not static mirrors
pub fn evictable(pod: &Pod) -> bool {
    let meta = &pod.metadata;
    let mirror = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
    let daemon = meta
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Succeeded" || p == "Failed");
    !(mirror || daemon || finished)
}

async fn pods_on(pods: &Api<Pod>, node: &str) -> Result<Vec<Pod>> {
    let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
    Ok(pods
        .list(&params)
        .await?
        .items
        .into_iter()
        .filter(evictable)
        .collect())
}

#[async_trait]
impl NodeDrainer for KubeNodeDrainer {
    #[instrument(skip(self, kubeconfig))]
    async fn drain_and_delete(&self, kubeconfig: &str, name: &str) -> Result<()> {
        let client = create_client_from_yaml(kubeconfig).await?;
        let nodes: Api<Node> = Api::all(client.clone());
        nodes
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({"spec": {"unschedulable": true}})),
            )
            .await?;
        info!(node = %name, "Node cordoned");

        let all_pods: Api<Pod> = Api::all(client.clone());
        for pod in pods_on(&all_pods, name).await? {
            let (Some(ns), Some(pod_name)) = (pod.metadata.namespace, pod.metadata.name) else {
                continue;
            };
            let api: Api<Pod> = Api::namespaced(client.clone(), &ns);
            let params = EvictParams {
                delete_options: Some(DeleteParams::default()),
                ..Default::default()
            };
            match api.evict(&pod_name, &params).await {
                Ok(_) => debug!(pod = %pod_name, namespace = %ns, "Pod evicted"),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        poll_until(
            self.timeout,
            DRAIN_POLL_INTERVAL,
            format!("pods still running on {}", name),
            || {
                let all_pods = all_pods.clone();
                let name = name.to_string();
                async move {
                    pods_on(&all_pods, &name)
                        .await
                        .map(|p| p.is_empty())
                        .map_err(|e| dodo_common::Error::internal(e.to_string()))
                }
            },
        )
        .await?;
        info!(node = %name, "Node drained");

        match nodes.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
