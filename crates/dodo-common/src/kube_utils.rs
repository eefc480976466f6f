//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction from a kubeconfig path or an in-memory kubeconfig
//! document (the cluster manager only ever holds the latter), idempotent
//! namespace creation, condition checks on dynamic objects and a generic
//! polling loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Condition status value meaning "satisfied"
pub const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path.
///
/// Falls back to in-cluster / `KUBECONFIG` inference when no path is given.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            from_kubeconfig(kubeconfig).await?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    build_client(config)
}

/// Create a kube client from the text of a kubeconfig document
pub async fn create_client_from_yaml(kubeconfig: &str) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to parse kubeconfig: {}", e),
        )
    })?;
    build_client(from_kubeconfig(kubeconfig).await?)
}

async fn from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {}", e))
        })
}

fn build_client(mut config: Config) -> Result<Client, Error> {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Ensure a namespace exists with the given labels (idempotent).
///
/// Server-side apply never fails on "already exists".
pub async fn ensure_namespace(
    client: &Client,
    name: &str,
    labels: &BTreeMap<String, String>,
    field_manager: &str,
) -> Result<(), kube::Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": labels,
        }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Apply(&ns))
        .await?;
    Ok(())
}

/// True when the API server reported that the object already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 || resp.reason == "AlreadyExists")
}

/// True when the API server reported that the object does not exist
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Check `status.conditions[]` of a dynamic object for `type == True`
pub fn has_condition(status: &serde_json::Value, condition_type: &str) -> bool {
    status
        .get("conditions")
        .and_then(|c| c.as_array())
        .is_some_and(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(condition_type)
                    && c.get("status").and_then(|s| s.as_str()) == Some(STATUS_TRUE)
            })
        })
}

/// Poll until a condition is met or timeout is reached.
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Errors from the check are treated as "not yet" and logged at trace level.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Timeout {
                elapsed_secs: start.elapsed().as_secs(),
                message: timeout_msg,
            });
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met"),
            Err(e) => trace!(error = %e, "Polling check failed, retrying"),
        }

        tokio::time::sleep(poll_interval).await;
    }
}
