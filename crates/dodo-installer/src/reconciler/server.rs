//! Reconciler service: annotates Flux objects and waits for Flux to act

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use tokio::net::TcpListener;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use dodo_common::kube_utils::{is_not_found, poll_until};

use super::REQUESTED_AT_ANNOTATION;
use crate::error::{Error, Result};

/// Flux object kinds the service reconciles
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FluxObject {
    /// `source.toolkit.fluxcd.io` GitRepository
    GitRepository,
    /// `kustomize.toolkit.fluxcd.io` Kustomization
    Kustomization,
}

impl FluxObject {
    fn api_resource(self) -> ApiResource {
        let (group, version, kind, plural) = match self {
            Self::GitRepository => ("source.toolkit.fluxcd.io", "v1", "GitRepository", "gitrepositories"),
            Self::Kustomization => ("kustomize.toolkit.fluxcd.io", "v1", "Kustomization", "kustomizations"),
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: format!("{}/{}", group, version),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }
}

/// Something that can force a Flux object to reconcile
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReconcileTarget: Send + Sync {
    /// Reconcile `namespace/name` and wait until Flux handled the request
    async fn reconcile(&self, object: FluxObject, namespace: &str, name: &str) -> Result<()>;
}

/// [`ReconcileTarget`] on the Kubernetes API
#[derive(Clone)]
pub struct KubeReconcileTarget {
    client: Client,
    timeout: Duration,
    poll_interval: Duration,
}

impl KubeReconcileTarget {
    /// Target waiting up to five minutes per request
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl ReconcileTarget for KubeReconcileTarget {
    async fn reconcile(&self, object: FluxObject, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &object.api_resource());
        let requested_at = chrono::Utc::now().to_rfc3339();
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { REQUESTED_AT_ANNOTATION: requested_at }
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        poll_until(
            self.timeout,
            self.poll_interval,
            format!("{:?} {}/{} to reconcile", object, namespace, name),
            || {
                let api = api.clone();
                let requested_at = requested_at.clone();
                async move {
                    let obj = api.get(name).await?;
                    Ok(obj
                        .data
                        .get("status")
                        .and_then(|s| s.get("lastHandledReconcileAt"))
                        .and_then(|v| v.as_str())
                        == Some(requested_at.as_str()))
                }
            },
        )
        .await?;
        Ok(())
    }
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Kube(e) if is_not_found(e) => StatusCode::NOT_FOUND,
            Error::Common(dodo_common::Error::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Reconcile request failed");
        }
        (status, self.0.to_string()).into_response()
    }
}

/// Routes of the reconciler service
pub fn router(target: Arc<dyn ReconcileTarget>) -> Router {
    Router::new()
        .route("/source/git/{namespace}/{name}/reconcile", get(source_handler))
        .route("/kustomization/{namespace}/{name}/reconcile", get(kustomization_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(target)
}

/// Serve the reconciler API on `addr` until the process is stopped
pub async fn serve(addr: SocketAddr, target: Arc<dyn ReconcileTarget>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Reconciler listening");
    axum::serve(listener, router(target)).await
}

async fn source_handler(
    State(target): State<Arc<dyn ReconcileTarget>>,
    Path((namespace, name)): Path<(String, String)>,
) -> std::result::Result<(), ApiError> {
    target
        .reconcile(FluxObject::GitRepository, &namespace, &name)
        .await
        .map_err(ApiError)
}

async fn kustomization_handler(
    State(target): State<Arc<dyn ReconcileTarget>>,
    Path((namespace, name)): Path<(String, String)>,
) -> std::result::Result<(), ApiError> {
    target
        .reconcile(FluxObject::Kustomization, &namespace, &name)
        .await
        .map_err(ApiError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use mockall::predicate::eq;
    use tower::ServiceExt;

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn routes_dispatch_to_object_kinds() {
        let mut target = MockReconcileTarget::new();
        target
            .expect_reconcile()
            .with(eq(FluxObject::GitRepository), eq("lekva"), eq("config"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        target
            .expect_reconcile()
            .with(eq(FluxObject::Kustomization), eq("lekva"), eq("config"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let app = router(Arc::new(target));

        let resp = app
            .clone()
            .oneshot(get_req("/source/git/lekva/config/reconcile"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .oneshot(get_req("/kustomization/lekva/config/reconcile"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn timeout_maps_to_gateway_timeout() {
        let mut target = MockReconcileTarget::new();
        target.expect_reconcile().returning(|_, _, _| {
            Err(Error::Common(dodo_common::Error::Timeout {
                elapsed_secs: 300,
                message: "waiting".to_string(),
            }))
        });
        let resp = router(Arc::new(target))
            .oneshot(get_req("/kustomization/lekva/config/reconcile"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn api_resources_use_flux_v1_groups() {
        let ar = FluxObject::GitRepository.api_resource();
        assert_eq!(ar.api_version, "source.toolkit.fluxcd.io/v1");
        assert_eq!(ar.plural, "gitrepositories");
        assert_eq!(FluxObject::Kustomization.api_resource().plural, "kustomizations");
    }
}
