//! First-time installation of the platform into an empty cluster
//!
//! Bootstrap is one sequential task. Its steps install the load balancer,
//! block storage and the Git server from local charts, hand the Git server
//! over to the operator's key, install Flux pointing at the new
//! configuration repository, lay out that repository and finally commit
//! the infrastructure apps for Flux to apply. A failed step aborts the run
//! and leaves whatever was installed for the operator to inspect.

mod charts;
mod config;

pub use charts::{ChartInstaller, ChartRelease, HelmChartInstaller, HELM_TIMEOUT};
pub use config::{BootstrapConfig, BOOTSTRAP_CONFIG_PATH};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use dodo_common::keys::SshKeyPair;
use dodo_common::retry::{retry_with_backoff, RetryConfig};
use dodo_gitops::kustomization::Kustomization;
use dodo_gitops::{DoOptions, GitServer, Permission, RepoStore, SoftServeClient};

use crate::env::CONFIG_PATH;
use crate::error::{Error, Result};
use crate::manager::{AppManager, InstallOptions, INFRA_DIR};
use crate::namespace::NamespaceCreator;
use crate::repository::AppRepository;
use crate::tasks::{Task, TaskError};

/// Name of the configuration repository
pub const CONFIG_REPO: &str = "config";
/// soft-serve user the bootstrap key belongs to
pub const ADMIN_USER: &str = "admin";
/// Metallb address pool names
pub const POOL_LOCAL: &str = "local";
/// Pool holding the Git server address
pub const POOL_CONFIG_REPO: &str = "config-repo";
/// Pool holding the public ingress address
pub const POOL_INGRESS_PUBLIC: &str = "ingress-public";

const METALLB_NAMESPACE: &str = "metallb-system";
const LONGHORN_NAMESPACE: &str = "longhorn-system";
const SSH_PORT: u16 = 22;
const CHARTS_REPO_URL: &str = "https://github.com/giolekva/pcloud";

/// Opens an admin connection to a freshly installed Git server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GitServerConnector: Send + Sync {
    /// Connect to `address` (`host:port`) authenticating with `private_key`
    async fn connect(&self, address: &str, private_key: &str) -> Result<Arc<dyn GitServer>>;
}

/// [`GitServerConnector`] for soft-serve over `ssh`
#[derive(Clone, Debug)]
pub struct SoftServeConnector {
    key_dir: PathBuf,
    retry: RetryConfig,
}

impl SoftServeConnector {
    /// Store private keys under `key_dir`
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            retry: RetryConfig::with_max_attempts(30),
        }
    }
}

#[async_trait]
impl GitServerConnector for SoftServeConnector {
    async fn connect(&self, address: &str, private_key: &str) -> Result<Arc<dyn GitServer>> {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .map_err(|_| Error::internal(format!("invalid git server address {}", address)))?,
            ),
            None => (address.to_string(), SSH_PORT),
        };
        tokio::fs::create_dir_all(&self.key_dir).await?;
        let key_path = self.key_dir.join(format!("{}-{}", host, port));
        tokio::fs::write(&key_path, private_key).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        let client = SoftServeClient::new(host, port, key_path);
        // The server is up once it answers a key scan.
        retry_with_backoff(&self.retry, "git server", || client.host_public_keys()).await?;
        info!(%address, "Connected to git server");
        Ok(Arc::new(client))
    }
}

#[derive(Default)]
struct Session {
    bootstrap_key: Option<SshKeyPair>,
    server: Option<Arc<dyn GitServer>>,
    repo: Option<Arc<RepoStore>>,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Session>>);

impl Shared {
    fn server(&self) -> Result<Arc<dyn GitServer>> {
        self.0
            .lock()
            .server
            .clone()
            .ok_or_else(|| Error::internal("git server is not connected"))
    }

    fn repo(&self) -> Result<Arc<RepoStore>> {
        self.0
            .lock()
            .repo
            .clone()
            .ok_or_else(|| Error::internal("configuration repository is not cloned"))
    }
}

/// Installs the platform into an empty cluster
#[derive(Clone)]
pub struct Bootstrapper {
    charts: Arc<dyn ChartInstaller>,
    namespaces: Arc<dyn NamespaceCreator>,
    git: Arc<dyn GitServerConnector>,
    apps: Arc<AppRepository>,
    workdir: PathBuf,
}

/// A prepared bootstrap run
pub struct BootstrapRun {
    task: Task,
    session: Shared,
}

impl BootstrapRun {
    /// Root task; subscribe to it before calling [`BootstrapRun::run`]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Run every step, then revoke the bootstrap key whatever the outcome
    pub async fn run(self) -> std::result::Result<(), TaskError> {
        let result = self.task.run().await;
        let (server, key) = {
            let session = self.session.0.lock();
            (session.server.clone(), session.bootstrap_key.clone())
        };
        if let (Some(server), Some(key)) = (server, key) {
            match server.remove_public_key(ADMIN_USER, &key.public).await {
                Ok(()) => info!("Revoked bootstrap key"),
                Err(e) => warn!(error = %e, "Failed to revoke bootstrap key"),
            }
        }
        result
    }
}

fn step<F, Fut>(title: impl Into<String>, f: F) -> Task
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Task::leaf(title, move || async move { f().await.map_err(TaskError::from) })
}

impl Bootstrapper {
    /// Bootstrapper cloning the configuration repository into `workdir`
    pub fn new(
        charts: Arc<dyn ChartInstaller>,
        namespaces: Arc<dyn NamespaceCreator>,
        git: Arc<dyn GitServerConnector>,
        apps: Arc<AppRepository>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            charts,
            namespaces,
            git,
            apps,
            workdir: workdir.into(),
        }
    }

    /// Build the task tree for `config` without starting it
    pub fn prepare(&self, config: BootstrapConfig) -> BootstrapRun {
        let config = Arc::new(config);
        let session = Shared::default();
        let task = Task::sequential(
            "Bootstrapping environment",
            vec![
                self.namespace_step(&config),
                self.load_balancer_step(&config),
                self.storage_step(&config),
                self.git_server_step(&config, &session),
                self.connect_step(&config, &session),
                self.flux_step(&config, &session),
                self.layout_step(&config, &session),
                self.infrastructure_step(&config, &session),
                self.env_services_step(&config, &session),
            ],
        );
        BootstrapRun { task, session }
    }

    /// Prepare and run
    pub async fn run(&self, config: BootstrapConfig) -> std::result::Result<(), TaskError> {
        self.prepare(config).run().await
    }

    fn chart_step(&self, release: ChartRelease) -> Task {
        let charts = Arc::clone(&self.charts);
        step(format!("Installing {}", release.name), move || async move {
            charts.install(&release).await
        })
    }

    fn namespace_step(&self, config: &Arc<BootstrapConfig>) -> Task {
        let namespaces = Arc::clone(&self.namespaces);
        let name = config.infra_name.clone();
        step("Creating environment namespace", move || async move {
            namespaces.create(&name).await
        })
    }

    fn load_balancer_step(&self, config: &BootstrapConfig) -> Task {
        let ips = &config.service_ips;
        let pool = |name: &str, auto_assign: bool, from: &str, to: &str| {
            self.chart_step(
                ChartRelease::new(name, "metallb-ipaddresspool", METALLB_NAMESPACE).values(json!({
                    "name": name,
                    "autoAssign": auto_assign,
                    "from": from,
                    "to": to,
                })),
            )
        };
        Task::sequential(
            "Installing load balancer",
            vec![
                self.chart_step(
                    ChartRelease::new("metallb-ns", "namespace", &config.infra_name)
                        .existing_namespace()
                        .values(json!({
                            "namespace": METALLB_NAMESPACE,
                            "labels": [
                                "pod-security.kubernetes.io/audit: privileged",
                                "pod-security.kubernetes.io/enforce: privileged",
                                "pod-security.kubernetes.io/warn: privileged",
                            ],
                        })),
                ),
                self.chart_step(
                    ChartRelease::new("metallb", "metallb", METALLB_NAMESPACE)
                        .with_crds()
                        .values(json!({
                            "controller": {
                                "image": image("quay.io/metallb/controller", "v0.13.12"),
                                "logLevel": "info",
                            },
                            "speaker": {
                                "image": image("quay.io/metallb/speaker", "v0.13.12"),
                                "logLevel": "info",
                            },
                        })),
                ),
                pool(POOL_LOCAL, true, &ips.services_from, &ips.services_to),
                pool(POOL_CONFIG_REPO, false, &ips.config_repo, &ips.config_repo),
                pool(POOL_INGRESS_PUBLIC, false, &ips.ingress_public, &ips.ingress_public),
            ],
        )
    }

    fn storage_step(&self, config: &BootstrapConfig) -> Task {
        self.chart_step(
            ChartRelease::new("longhorn", "longhorn", LONGHORN_NAMESPACE).values(json!({
                "defaultSettings": { "defaultDataPath": config.storage_dir },
                "persistence": {
                    "defaultClassReplicaCount": config.volume_default_replica_count,
                },
                "service": { "ui": { "type": "LoadBalancer" } },
                "ingress": { "enabled": false },
            })),
        )
    }

    fn git_server_step(&self, config: &Arc<BootstrapConfig>, session: &Shared) -> Task {
        let charts = Arc::clone(&self.charts);
        let config = Arc::clone(config);
        let session = session.clone();
        step("Installing Git server", move || async move {
            let bootstrap_key = SshKeyPair::generate()?;
            let host_key = SshKeyPair::generate()?;
            let release = ChartRelease::new("soft-serve", "soft-serve", &config.infra_name).values(json!({
                "image": image("charmcli/soft-serve", "v0.7.1"),
                "privateKey": host_key.private,
                "publicKey": host_key.public,
                "adminKey": bootstrap_key.public,
                "reservedIP": config.service_ips.config_repo,
                "serviceType": "LoadBalancer",
            }));
            session.0.lock().bootstrap_key = Some(bootstrap_key);
            charts.install(&release).await
        })
    }

    fn connect_step(&self, config: &Arc<BootstrapConfig>, session: &Shared) -> Task {
        let git = Arc::clone(&self.git);
        let config = Arc::clone(config);
        let session = session.clone();
        step("Connecting to Git server", move || async move {
            let key = session
                .0
                .lock()
                .bootstrap_key
                .clone()
                .ok_or_else(|| Error::internal("bootstrap key was not generated"))?;
            let address = format!("{}:{}", config.service_ips.config_repo, SSH_PORT);
            let server = git.connect(&address, &key.private).await?;
            session.0.lock().server = Some(Arc::clone(&server));
            server
                .add_public_key(ADMIN_USER, &config.admin_public_key)
                .await?;
            Ok(())
        })
    }

    fn flux_step(&self, config: &Arc<BootstrapConfig>, session: &Shared) -> Task {
        let charts = Arc::clone(&self.charts);
        let config = Arc::clone(config);
        let session = session.clone();
        let workdir = self.workdir.join(CONFIG_REPO);
        step("Installing Flux", move || async move {
            let server = session.server()?;
            let keys = SshKeyPair::generate()?;
            server.add_user("flux", &keys.public).await?;
            server.make_admin("flux").await?;
            server.add_repository(CONFIG_REPO).await?;

            let repo = server.clone_repo(CONFIG_REPO, &workdir).await?;
            let readme = format!("# {} systems", config.infra_name);
            repo.run_async(DoOptions::default(), move |fs| {
                fs.write_string("/README.md", &readme)?;
                Ok::<_, Error>("readme".to_string())
            })
            .await?;
            session.0.lock().repo = Some(repo);

            let host = config.service_ips.config_repo.clone();
            let host_keys = server.host_public_keys().await?;
            let release = ChartRelease::new("flux", "flux-bootstrap", &config.infra_name).values(json!({
                "image": image("fluxcd/flux-cli", "v2.1.2"),
                "repositoryAddress": server.repo_address(CONFIG_REPO),
                "repositoryHost": host,
                "repositoryHostPublicKeys": host_keys.join("\n"),
                "privateKey": keys.private,
                "installationNamespace": format!("{}-flux", config.infra_name),
            }));
            charts.install(&release).await
        })
    }

    fn layout_step(&self, config: &Arc<BootstrapConfig>, session: &Shared) -> Task {
        let config = Arc::clone(config);
        let session = session.clone();
        step("Configuring main repository", move || async move {
            let repo = session.repo()?;
            repo.run_async(DoOptions::default(), move |fs| {
                fs.write_yaml(BOOTSTRAP_CONFIG_PATH, &*config)?;
                fs.write_yaml(CONFIG_PATH, &config.infra_env())?;
                fs.write_yaml(
                    "/kustomization.yaml",
                    &Kustomization::with_resources([
                        format!("{}-flux", config.infra_name),
                        "infrastructure".to_string(),
                        "environments".to_string(),
                    ]),
                )?;
                fs.write_string(
                    &format!("{}/pcloud-charts.yaml", INFRA_DIR),
                    &charts_repository(&config.infra_name),
                )?;
                fs.write_yaml(
                    &format!("{}/kustomization.yaml", INFRA_DIR),
                    &Kustomization::with_resources(["pcloud-charts.yaml"]),
                )?;
                fs.write_yaml("/environments/kustomization.yaml", &Kustomization::default())?;
                Ok::<_, Error>("init: directory structure".to_string())
            })
            .await?;
            Ok(())
        })
    }

    fn infra_app_step(
        &self,
        slug: &'static str,
        config: &Arc<BootstrapConfig>,
        session: &Shared,
        values: impl FnOnce(Arc<dyn GitServer>) -> BoxFuture<'static, Result<Value>>
            + Send
            + 'static,
    ) -> Task {
        let this = self.clone();
        let config = Arc::clone(config);
        let session = session.clone();
        step(format!("Installing {}", slug), move || async move {
            let values = values(session.server()?).await?;
            let template = this.apps.find_infra_app(slug)?;
            let manager = AppManager::new(session.repo()?, Arc::clone(&this.namespaces))?;
            let opts = InstallOptions::default()
                .with_env(config.infra_env())
                .with_networks(Vec::new());
            manager
                .install_infra(
                    template,
                    &format!("{}/{}", INFRA_DIR, template.slug),
                    &config.namespace(&template.namespace),
                    &values,
                    opts,
                )
                .await?;
            Ok(())
        })
    }

    fn infrastructure_step(&self, config: &Arc<BootstrapConfig>, session: &Shared) -> Task {
        let plain = |slug: &'static str| {
            self.infra_app_step(slug, config, session, |_| {
                Box::pin(async { Ok(json!({})) })
            })
        };
        let email = config.contact_email.clone();
        let port_allocator_user = format!("{}-port-allocator", config.infra_name);
        Task::sequential(
            "Installing infrastructure services",
            vec![
                plain("resource-renderer-controller"),
                plain("headscale-controller"),
                plain("csi-driver-smb"),
                self.infra_app_step("cert-manager", config, session, move |_| {
                    Box::pin(async move { Ok(json!({ "email": email })) })
                }),
                self.infra_app_step("ingress-public", config, session, move |server| {
                    Box::pin(async move {
                        let keys = SshKeyPair::generate()?;
                        server.add_user(&port_allocator_user, &keys.public).await?;
                        server
                            .add_collaborator(
                                CONFIG_REPO,
                                &port_allocator_user,
                                Permission::ReadWrite,
                            )
                            .await?;
                        Ok(json!({ "sshPrivateKey": keys.private }))
                    })
                }),
                plain("fluxcd-reconciler"),
            ],
        )
    }

    fn env_services_step(&self, config: &Arc<BootstrapConfig>, session: &Shared) -> Task {
        let env_manager_user = format!("{}-env-manager", config.infra_name);
        let repo_ip = config.service_ips.config_repo.clone();
        Task::sequential(
            "Installing environment services",
            vec![
                self.infra_app_step("dns-gateway", config, session, |_| {
                    Box::pin(async { Ok(json!({ "servers": [] })) })
                }),
                self.infra_app_step("env-manager", config, session, move |server| {
                    Box::pin(async move {
                        let keys = SshKeyPair::generate()?;
                        server.add_user(&env_manager_user, &keys.public).await?;
                        server.make_admin(&env_manager_user).await?;
                        Ok(json!({
                            "repoIP": repo_ip,
                            "repoPort": SSH_PORT,
                            "repoName": CONFIG_REPO,
                            "sshPrivateKey": keys.private,
                        }))
                    })
                }),
            ],
        )
    }
}

fn image(repository: &str, tag: &str) -> Value {
    json!({
        "repository": repository,
        "tag": tag,
        "pullPolicy": "IfNotPresent",
    })
}

fn charts_repository(namespace: &str) -> String {
    format!(
        r#"apiVersion: source.toolkit.fluxcd.io/v1
kind: GitRepository
metadata:
  name: pcloud
  namespace: {}
spec:
  interval: 1m0s
  url: {}
  ref:
    branch: main
"#,
        namespace, CHARTS_REPO_URL
    )
}

#[cfg(test)]
mod tests {
    use super::config::tests::config;
    use super::*;
    use crate::namespace::MockNamespaceCreator;
    use crate::tasks::Status;
    use dodo_gitops::{LocalBackend, RepoFs};
    use std::collections::HashSet;
    use std::path::Path;

    /// Cluster that refuses to install a release twice
    #[derive(Default)]
    struct FakeCluster {
        releases: Mutex<HashSet<(String, String)>>,
    }

    #[async_trait]
    impl ChartInstaller for FakeCluster {
        async fn install(&self, release: &ChartRelease) -> Result<()> {
            let key = (release.namespace.clone(), release.name.clone());
            if !self.releases.lock().insert(key) {
                return Err(Error::command(
                    format!("helm install {}", release.name),
                    "cannot re-use a name that is still in use",
                ));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGitServer {
        calls: Mutex<Vec<String>>,
    }

    impl FakeGitServer {
        fn record(&self, call: String) -> dodo_gitops::Result<()> {
            self.calls.lock().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl GitServer for FakeGitServer {
        async fn add_user(&self, name: &str, _public_key: &str) -> dodo_gitops::Result<()> {
            self.record(format!("add-user {}", name))
        }

        async fn make_admin(&self, name: &str) -> dodo_gitops::Result<()> {
            self.record(format!("make-admin {}", name))
        }

        async fn add_public_key(&self, user: &str, public_key: &str) -> dodo_gitops::Result<()> {
            self.record(format!("add-pubkey {} {}", user, public_key))
        }

        async fn remove_public_key(&self, user: &str, public_key: &str) -> dodo_gitops::Result<()> {
            self.record(format!("remove-pubkey {} {}", user, public_key))
        }

        async fn add_repository(&self, name: &str) -> dodo_gitops::Result<()> {
            self.record(format!("add-repo {}", name))
        }

        async fn add_collaborator(
            &self,
            repo: &str,
            user: &str,
            permission: Permission,
        ) -> dodo_gitops::Result<()> {
            self.record(format!("collab {} {} {:?}", repo, user, permission))
        }

        async fn add_webhook(&self, repo: &str, url: &str) -> dodo_gitops::Result<()> {
            self.record(format!("webhook {} {}", repo, url))
        }

        async fn host_public_keys(&self) -> dodo_gitops::Result<Vec<String>> {
            Ok(vec!["192.168.100.210 ssh-ed25519 AAAAhost".to_string()])
        }

        fn repo_address(&self, name: &str) -> String {
            format!("ssh://192.168.100.210:22/{}", name)
        }

        async fn clone_repo(&self, _name: &str, dir: &Path) -> dodo_gitops::Result<Arc<RepoStore>> {
            Ok(RepoStore::new(LocalBackend::new(dir)?))
        }
    }

    struct Connector(Arc<FakeGitServer>);

    #[async_trait]
    impl GitServerConnector for Connector {
        async fn connect(&self, address: &str, _private_key: &str) -> Result<Arc<dyn GitServer>> {
            assert_eq!(address, "192.168.100.210:22");
            Ok(Arc::clone(&self.0) as Arc<dyn GitServer>)
        }
    }

    fn bootstrapper(workdir: &Path) -> (Bootstrapper, Arc<FakeGitServer>) {
        let mut namespaces = MockNamespaceCreator::new();
        namespaces.expect_create().returning(|_| Ok(()));
        let server = Arc::new(FakeGitServer::default());
        let b = Bootstrapper::new(
            Arc::new(FakeCluster::default()),
            Arc::new(namespaces),
            Arc::new(Connector(Arc::clone(&server))),
            Arc::new(AppRepository::embedded().expect("apps")),
            workdir,
        );
        (b, server)
    }

    #[tokio::test]
    async fn bootstrap_lays_out_repository_and_revokes_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (b, server) = bootstrapper(dir.path());
        b.run(config()).await.expect("bootstrap");

        let fs = RepoFs::new(dir.path().join(CONFIG_REPO));
        let root: Kustomization = fs.read_yaml("/kustomization.yaml").expect("root");
        assert_eq!(&root.resources[..3], ["dodo-flux", "infrastructure", "environments"]);
        let infra: Kustomization = fs.read_yaml("/infrastructure/kustomization.yaml").expect("infra");
        assert_eq!(infra.resources[0], "pcloud-charts.yaml");
        for slug in ["cert-manager", "ingress-public", "fluxcd-reconciler", "env-manager"] {
            assert!(infra.contains(slug), "{} not listed", slug);
        }
        let stored: BootstrapConfig = fs.read_yaml(BOOTSTRAP_CONFIG_PATH).expect("bootstrap config");
        assert_eq!(stored, config());
        assert!(fs.exists("/README.md").expect("readme"));

        let calls = server.calls.lock().clone();
        assert_eq!(calls[0], "add-pubkey admin ssh-ed25519 AAAAoperator");
        assert!(calls.contains(&"collab config dodo-port-allocator ReadWrite".to_string()));
        assert!(calls.contains(&"make-admin dodo-env-manager".to_string()));
        assert!(calls.last().expect("calls").starts_with("remove-pubkey admin ecdsa-sha2-nistp256"));
    }

    #[tokio::test]
    async fn second_run_fails_past_the_namespace_step() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (b, _server) = bootstrapper(dir.path());
        b.run(config()).await.expect("first run");

        let run = b.prepare(config());
        let task = run.task().clone();
        let err = run.run().await.expect_err("second run");
        assert!(err.0.contains("metallb-ns"), "{}", err);

        let steps = task.children();
        assert_eq!(steps[0].status(), Status::Done);
        assert_eq!(steps[1].status(), Status::Failed);
        assert_eq!(steps[1].children()[0].title(), "Installing metallb-ns");
        assert!(steps[2..].iter().all(|s| s.status() == Status::Pending));
    }

    #[tokio::test]
    async fn connector_failure_stops_before_flux() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut namespaces = MockNamespaceCreator::new();
        namespaces.expect_create().returning(|_| Ok(()));
        let mut git = MockGitServerConnector::new();
        git.expect_connect()
            .returning(|_, _| Err(Error::command("ssh-keyscan", "connection refused")));
        let b = Bootstrapper::new(
            Arc::new(FakeCluster::default()),
            Arc::new(namespaces),
            Arc::new(git),
            Arc::new(AppRepository::embedded().expect("apps")),
            dir.path(),
        );
        let run = b.prepare(config());
        let task = run.task().clone();
        run.run().await.expect_err("unreachable git server");
        assert_eq!(task.children()[4].status(), Status::Failed);
        assert_eq!(task.children()[5].status(), Status::Pending);
    }
}
