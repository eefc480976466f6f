//! Installing, updating and removing app instances
//!
//! Every instance lives in its own directory of the configuration
//! repository:
//!
//! ```text
//! /apps/<id>/config.yaml            instance record
//! /apps/<id>/kustomization.yaml     lists resources
//! /apps/<id>/resources/*.yaml       rendered manifests
//! ```
//!
//! and is listed by `/apps/kustomization.yaml`, which the environment's
//! Flux kustomization applies.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use dodo_gitops::kustomization::{self, Kustomization};
use dodo_gitops::{DoOptions, RepoFs, RepoStore};
use dodo_port_allocator::{AllocateRequest, RemoveRequest, ReserveRequest};

use crate::env::{self, EnvConfig, Network, CONFIG_PATH};
use crate::error::{Error, Result};
use crate::namespace::NamespaceCreator;
use crate::ports::PortAllocatorClient;
use crate::reconciler::Reconciler;
use crate::template::{AppTemplate, Evaluation, PortForward, Release, ReleaseRef, TemplateEvaluator};
use crate::vpn::VpnKeyIssuer;

/// Directory holding env app instances
pub const APPS_DIR: &str = "/apps";
/// Directory holding infra app instances
pub const INFRA_DIR: &str = "/infrastructure";
/// Instance record inside an instance directory
pub const INSTANCE_CONFIG_FILE: &str = "config.yaml";
/// App whose instances add networks to the catalog
pub const NETWORK_APP: &str = "network";

const RESOURCES_DIR: &str = "resources";
const GITIGNORE_FILE: &str = ".gitignore";
const INCLUDE_EVERYTHING: &str = "!*";
const INSTANCE_SUFFIX_LEN: usize = 6;

/// What an instance was rendered from
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedRecord {
    /// Release descriptor
    pub release: Release,
    /// Environment configuration at install time
    pub global: EnvConfig,
    /// Derived input
    pub input: Map<String, Value>,
}

/// Ingress port held by an instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedPort {
    /// Network whose ingress serves the port
    pub network: String,
    /// `tcp` or `udp`
    pub protocol: String,
    /// Ingress port
    pub source_port: u16,
    /// Service receiving the traffic
    pub target_service: String,
    /// Port on that service
    pub target_port: u16,
    /// Secret proving ownership of the mapping
    pub secret: String,
    /// Endpoint releasing the port
    pub remove_addr: String,
}

impl AllocatedPort {
    fn serves(&self, forward: &PortForward) -> bool {
        self.network == forward.network
            && self.protocol.eq_ignore_ascii_case(&forward.protocol)
            && self.target_service == forward.target_service
            && self.target_port == forward.target_port
            && forward.source_port.is_none_or(|p| p == self.source_port)
    }
}

/// Record stored as `config.yaml` in the instance directory
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstanceConfig {
    /// Instance id
    pub id: String,
    /// Slug of the template
    pub app_id: String,
    /// Input as the user would supply it again
    pub config: Map<String, Value>,
    /// Values the resources were rendered with
    pub derived: DerivedRecord,
    /// Ingress ports held by the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<AllocatedPort>,
}

/// Knobs of an install or update
#[derive(Clone, Debug, Default)]
pub struct InstallOptions {
    /// Skip pulling the repository
    pub no_pull: bool,
    /// Write the working tree only
    pub no_commit: bool,
    /// Force-push
    pub force: bool,
    /// Push to this branch
    pub branch: Option<String>,
    /// Use this environment instead of `/config.yaml`
    pub env: Option<EnvConfig>,
    /// Use this catalog instead of deriving one
    pub networks: Option<Vec<Network>>,
}

impl InstallOptions {
    /// Skip pulling the repository
    pub fn no_pull(mut self) -> Self {
        self.no_pull = true;
        self
    }

    /// Write the working tree only
    pub fn no_commit(mut self) -> Self {
        self.no_commit = true;
        self
    }

    /// Force-push
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Push to `branch`
    pub fn to_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Render against `env`
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self
    }

    /// Resolve networks against `networks`
    pub fn with_networks(mut self, networks: Vec<Network>) -> Self {
        self.networks = Some(networks);
        self
    }

    fn do_options(&self) -> DoOptions {
        DoOptions {
            no_pull: self.no_pull,
            no_commit: self.no_commit,
            force: self.force,
            to_branch: self.branch.clone(),
        }
    }
}

/// What an install produced
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResources {
    /// Release descriptor
    pub release: Release,
    /// Helm releases to wait for
    pub helm: Vec<ReleaseRef>,
}

struct Target<'a> {
    template: &'a AppTemplate,
    instance_id: String,
    app_dir: String,
    namespace: String,
    action: &'static str,
    previous_ports: Vec<AllocatedPort>,
}

/// Installs apps into the configuration repository
pub struct AppManager {
    repo: Arc<RepoStore>,
    namespaces: Arc<dyn NamespaceCreator>,
    ports: Option<Arc<dyn PortAllocatorClient>>,
    vpn: Option<Arc<dyn VpnKeyIssuer>>,
    reconciler: Option<(Arc<dyn Reconciler>, String, String)>,
    pending: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    evaluator: TemplateEvaluator,
    lock: Mutex<()>,
}

impl AppManager {
    /// Manager over `repo`
    pub fn new(repo: Arc<RepoStore>, namespaces: Arc<dyn NamespaceCreator>) -> Result<Self> {
        Ok(Self {
            repo,
            namespaces,
            ports: None,
            vpn: None,
            reconciler: None,
            pending: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            evaluator: TemplateEvaluator::new()?,
            lock: Mutex::new(()),
        })
    }

    /// Open ingress ports through `client`
    pub fn with_ports(mut self, client: Arc<dyn PortAllocatorClient>) -> Self {
        self.ports = Some(client);
        self
    }

    /// Issue VPN keys through `issuer`
    pub fn with_vpn(mut self, issuer: Arc<dyn VpnKeyIssuer>) -> Self {
        self.vpn = Some(issuer);
        self
    }

    /// Reconcile the Flux kustomization `namespace/name` after every commit
    pub fn with_reconciler(
        mut self,
        reconciler: Arc<dyn Reconciler>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.reconciler = Some((reconciler, namespace.into(), name.into()));
        self
    }

    /// Abandon in-flight reconciliation once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait for reconciliation triggered by earlier commits
    pub async fn wait_reconciled(&self) {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconciliation task failed");
            }
        }
    }

    /// Configuration repository
    pub fn repo(&self) -> &Arc<RepoStore> {
        &self.repo
    }

    /// Environment configuration
    pub async fn config(&self) -> Result<EnvConfig> {
        self.read_config(true).await
    }

    async fn read_config(&self, pull: bool) -> Result<EnvConfig> {
        self.repo
            .read_async(pull, |fs| Ok::<_, Error>(fs.read_yaml(CONFIG_PATH)?))
            .await
    }

    /// Instance record at `path`
    pub async fn app_config(&self, path: &str) -> Result<AppInstanceConfig> {
        let path = path.to_string();
        self.repo
            .read_async(false, move |fs| Ok::<_, Error>(fs.read_yaml(&path)?))
            .await
    }

    /// Instance by id
    pub async fn find_instance(&self, id: &str) -> Result<AppInstanceConfig> {
        let id = id.to_string();
        self.repo
            .read_async(false, move |fs| read_instance(fs, APPS_DIR, &id))
            .await
    }

    /// Every installed instance, in install order
    pub async fn find_all(&self) -> Result<Vec<AppInstanceConfig>> {
        self.repo
            .read_async(true, |fs| {
                let list = kustomization::read_or_default(fs, APPS_DIR)?;
                list.resources
                    .iter()
                    .map(|id| read_instance(fs, APPS_DIR, id))
                    .collect::<Result<Vec<_>>>()
            })
            .await
    }

    /// Installed instances of the app `slug`
    pub async fn find_all_instances(&self, slug: &str) -> Result<Vec<AppInstanceConfig>> {
        Ok(self
            .find_all()
            .await?
            .into_iter()
            .filter(|i| i.app_id == slug)
            .collect())
    }

    /// Network catalog of `env` plus the networks added by `network` instances
    pub async fn networks(&self, env: &EnvConfig) -> Result<Vec<Network>> {
        let mut networks = env::create_networks(env);
        for instance in self.find_all_instances(NETWORK_APP).await? {
            let field = |name: &str| instance.config.get(name).and_then(Value::as_str);
            match (field("name"), field("domain")) {
                (Some(name), Some(domain)) => networks.push(env::custom_network(env, name, domain)),
                _ => warn!(instance = %instance.id, "Network instance without name or domain"),
            }
        }
        Ok(networks)
    }

    /// Fresh id for an instance of `slug`
    pub fn generate_instance_id(slug: &str) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..INSTANCE_SUFFIX_LEN)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect();
        format!("{}-{}", slug, suffix)
    }

    /// Install `template` as `instance_id` under `app_dir`
    #[instrument(skip(self, template, values, opts), fields(app = %template.slug))]
    pub async fn install(
        &self,
        template: &AppTemplate,
        instance_id: &str,
        app_dir: &str,
        namespace: &str,
        values: &Value,
        opts: InstallOptions,
    ) -> Result<ReleaseResources> {
        let _guard = self.lock.lock().await;
        let target = Target {
            template,
            instance_id: instance_id.to_string(),
            app_dir: app_dir.to_string(),
            namespace: namespace.to_string(),
            action: "install",
            previous_ports: Vec::new(),
        };
        self.apply(target, values, opts).await
    }

    /// Install an infra app under `/infrastructure/<slug>`
    pub async fn install_infra(
        &self,
        template: &AppTemplate,
        app_dir: &str,
        namespace: &str,
        values: &Value,
        opts: InstallOptions,
    ) -> Result<ReleaseResources> {
        let _guard = self.lock.lock().await;
        let target = Target {
            template,
            instance_id: template.slug.clone(),
            app_dir: app_dir.to_string(),
            namespace: namespace.to_string(),
            action: "install",
            previous_ports: Vec::new(),
        };
        self.apply(target, values, opts).await
    }

    /// Re-render an instance with new `values`, keeping its namespace and
    /// directory
    #[instrument(skip(self, template, values, opts), fields(app = %template.slug))]
    pub async fn update(
        &self,
        template: &AppTemplate,
        instance_id: &str,
        values: &Value,
        opts: InstallOptions,
    ) -> Result<ReleaseResources> {
        let _guard = self.lock.lock().await;
        let id = instance_id.to_string();
        let record = self
            .repo
            .read_async(!opts.no_pull, move |fs| read_instance(fs, APPS_DIR, &id))
            .await?;
        if record.app_id != template.slug {
            return Err(Error::invalid_package(
                &template.slug,
                format!("instance {} was installed from {}", instance_id, record.app_id),
            ));
        }
        let target = Target {
            template,
            instance_id: record.id,
            app_dir: record.derived.release.app_dir,
            namespace: record.derived.release.namespace,
            action: "update",
            previous_ports: record.ports,
        };
        self.apply(target, values, opts.no_pull()).await
    }

    /// Remove an instance and release its ports
    #[instrument(skip(self))]
    pub async fn remove(&self, instance_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let id = instance_id.to_string();
        let (_, record) = self
            .repo
            .run_with_async(DoOptions::default(), move |fs| {
                let record = read_instance(fs, APPS_DIR, &id)?;
                fs.remove_dir(&record.derived.release.app_dir)?;
                kustomization::unlink(fs, APPS_DIR, &id)?;
                Ok::<_, Error>((format!("uninstall: {}", id), record))
            })
            .await?;
        info!(instance = %instance_id, "Removed app instance");
        self.reconcile();

        for port in &record.ports {
            if let Err(e) = self.deallocate(port).await {
                warn!(instance = %instance_id, port = port.source_port, error = %e, "Failed to release port");
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        target: Target<'_>,
        values: &Value,
        opts: InstallOptions,
    ) -> Result<ReleaseResources> {
        let env = match &opts.env {
            Some(env) => env.clone(),
            None => self.read_config(!opts.no_pull).await?,
        };
        let networks = match &opts.networks {
            Some(networks) => networks.clone(),
            None => self.networks(&env).await?,
        };
        let release = Release {
            namespace: target.namespace.clone(),
            app_instance_id: target.instance_id.clone(),
            repo_addr: self.repo.address().to_string(),
            app_dir: target.app_dir.clone(),
        };
        let eval = self
            .evaluator
            .evaluate(
                target.template,
                &release,
                &env,
                &networks,
                values,
                self.vpn.as_deref(),
            )
            .await?;

        self.namespaces.create(&release.namespace).await?;
        for extra in &target.template.namespaces {
            self.namespaces.create(&env.namespace(extra)).await?;
        }

        let (kept, reserved) = self
            .reserve_ports(&eval.rendered.ports, &networks, &target.previous_ports)
            .await?;
        let mut ports = kept.clone();
        ports.extend(reserved.iter().cloned());

        let record = AppInstanceConfig {
            id: target.instance_id.clone(),
            app_id: target.template.slug.clone(),
            config: eval.config.clone(),
            derived: DerivedRecord {
                release: release.clone(),
                global: env.clone(),
                input: eval.derived.clone(),
            },
            ports,
        };
        let message = format!("{}: {}", target.action, target.instance_id);
        let app_dir = target.app_dir.clone();
        let Evaluation { rendered, .. } = eval;
        let resources = rendered.resources;
        self.repo
            .run_async(opts.do_options(), move |fs| {
                write_instance(fs, &app_dir, &record, &resources)?;
                Ok::<_, Error>(message)
            })
            .await?;
        info!(instance = %target.instance_id, dir = %target.app_dir, "Committed app instance");

        for port in &reserved {
            self.allocate(port, &networks).await?;
        }
        for stale in target.previous_ports.iter().filter(|p| !kept.contains(*p)) {
            if let Err(e) = self.deallocate(stale).await {
                warn!(port = stale.source_port, error = %e, "Failed to release stale port");
            }
        }
        if !opts.no_commit {
            self.reconcile();
        }

        Ok(ReleaseResources {
            release,
            helm: rendered.helm,
        })
    }

    /// Reuse previous ports that still serve a forward, reserve the rest
    async fn reserve_ports(
        &self,
        forwards: &[PortForward],
        networks: &[Network],
        previous: &[AllocatedPort],
    ) -> Result<(Vec<AllocatedPort>, Vec<AllocatedPort>)> {
        let mut kept = Vec::new();
        let mut reserved = Vec::new();
        for forward in forwards {
            if let Some(prev) = previous.iter().find(|p| p.serves(forward) && !kept.contains(*p)) {
                kept.push(prev.clone());
                continue;
            }
            let client = self.port_client()?;
            let network = env::find_network(networks, &forward.network).ok_or_else(|| {
                Error::UnknownNetwork {
                    path: "ports".to_string(),
                    name: forward.network.clone(),
                }
            })?;
            let resp = client
                .reserve(
                    &network.reserve_port_addr,
                    &ReserveRequest {
                        protocol: Some(forward.protocol.clone()),
                        source_port: forward.source_port,
                    },
                )
                .await?;
            reserved.push(AllocatedPort {
                network: forward.network.clone(),
                protocol: forward.protocol.to_lowercase(),
                source_port: resp.port,
                target_service: forward.target_service.clone(),
                target_port: forward.target_port,
                secret: resp.secret,
                remove_addr: network.deallocate_port_addr.clone(),
            });
        }
        Ok((kept, reserved))
    }

    async fn allocate(&self, port: &AllocatedPort, networks: &[Network]) -> Result<()> {
        let client = self.port_client()?;
        let network = env::find_network(networks, &port.network).ok_or_else(|| {
            Error::UnknownNetwork {
                path: "ports".to_string(),
                name: port.network.clone(),
            }
        })?;
        client
            .allocate(
                &network.allocate_port_addr,
                &AllocateRequest {
                    protocol: port.protocol.clone(),
                    source_port: Some(port.source_port),
                    target_service: port.target_service.clone(),
                    target_port: port.target_port,
                    secret: Some(port.secret.clone()),
                },
            )
            .await?;
        Ok(())
    }

    async fn deallocate(&self, port: &AllocatedPort) -> Result<()> {
        self.port_client()?
            .deallocate(
                &port.remove_addr,
                &RemoveRequest {
                    protocol: port.protocol.clone(),
                    source_port: port.source_port,
                    secret: port.secret.clone(),
                },
            )
            .await
    }

    fn port_client(&self) -> Result<&Arc<dyn PortAllocatorClient>> {
        self.ports
            .as_ref()
            .ok_or_else(|| Error::internal("app declares ports but no port allocator is configured"))
    }

    /// Trigger reconciliation in the background so the manager lock is
    /// released while the reconciler service answers
    fn reconcile(&self) {
        let Some((reconciler, namespace, name)) = self.reconciler.clone() else {
            return;
        };
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(namespace = %namespace, name = %name, "Reconciliation cancelled");
                }
                _ = reconciler.reconcile(&namespace, &name) => {}
            }
        });
        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}

fn instance_config_path(root: &str, id: &str) -> String {
    format!("{}/{}/{}", root.trim_end_matches('/'), id, INSTANCE_CONFIG_FILE)
}

fn read_instance(fs: &RepoFs, root: &str, id: &str) -> Result<AppInstanceConfig> {
    let path = instance_config_path(root, id);
    if !fs.exists(&path)? {
        return Err(Error::InstanceNotFound(id.to_string()));
    }
    let mut record: AppInstanceConfig = fs.read_yaml(&path)?;
    record.id = id.to_string();
    Ok(record)
}

fn write_instance(
    fs: &RepoFs,
    app_dir: &str,
    record: &AppInstanceConfig,
    resources: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
    let app_dir = app_dir.trim_end_matches('/');
    let resources_dir = format!("{}/{}", app_dir, RESOURCES_DIR);
    fs.remove_dir(app_dir)?;
    fs.create_dir(&resources_dir)?;
    fs.write_string(&format!("{}/{}", app_dir, GITIGNORE_FILE), INCLUDE_EVERYTHING)?;
    fs.write_yaml(&format!("{}/{}", app_dir, INSTANCE_CONFIG_FILE), record)?;
    for (name, text) in resources {
        fs.write_string(&format!("{}/{}", resources_dir, name), text)?;
    }
    fs.write_yaml(
        &kustomization::kustomization_path(&resources_dir),
        &Kustomization::with_resources(resources.keys().cloned()),
    )?;
    kustomization::create_chain(fs, &resources_dir)?;
    Ok(())
}
