//! App commands - install, update and remove app instances
//!
//! Every command works on a local clone of the configuration repository and
//! pushes the result; Flux applies it from there.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Args, Subcommand};
use serde_json::Value;
use tracing::info;

use dodo_installer::manager::APPS_DIR;
use dodo_installer::ports::HttpPortAllocatorClient;
use dodo_installer::reconciler::HttpReconcilerClient;
use dodo_installer::vpn::HeadscaleClient;
use dodo_installer::{
    AppManager, AppRepository, HelmReleaseStatus, InstallOptions, KubeNamespaceCreator,
    NamespaceCreator, ReleaseMonitor, ReleaseResources,
};

use super::{app_repository, kube_client, report_progress, CommandErrorExt, RepoArgs};
use crate::{Error, Result};

#[derive(Subcommand, Debug)]
pub enum AppCommands {
    /// List the app catalog
    Catalog(CatalogArgs),
    /// List installed instances
    List(ManagerArgs),
    /// Print the record of an instance
    Show {
        /// Instance id
        id: String,
        #[command(flatten)]
        manager: ManagerArgs,
    },
    /// Install an app
    Install(InstallArgs),
    /// Re-render an instance with new input
    Update(UpdateArgs),
    /// Remove an instance
    Remove {
        /// Instance id
        id: String,
        #[command(flatten)]
        manager: ManagerArgs,
    },
}

#[derive(Args, Debug)]
pub struct CatalogArgs {
    /// Extra app packages on top of the embedded catalog
    #[arg(long)]
    pub apps_dir: Option<PathBuf>,
}

/// Options shared by every command touching the repository
#[derive(Args, Debug)]
pub struct ManagerArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Extra app packages on top of the embedded catalog
    #[arg(long)]
    pub apps_dir: Option<PathBuf>,

    /// Path to kubeconfig, inferred from the environment when absent
    #[arg(short = 'k', long)]
    pub kubeconfig: Option<PathBuf>,

    /// Reconciler service to notify after each commit
    #[arg(long, env = "DODO_RECONCILER_ADDR")]
    pub reconciler_addr: Option<String>,

    /// VPN coordinator API issuing pre-authorized keys
    #[arg(long, env = "DODO_HEADSCALE_API_ADDR")]
    pub headscale_addr: Option<String>,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Slug of the app to install
    pub app: String,

    /// Input as JSON or YAML, inline or a file path
    #[arg(long, default_value = "{}")]
    pub values: String,

    /// Instance id, generated from the slug when absent
    #[arg(long)]
    pub id: Option<String>,

    /// Wait for the app's Helm releases to converge
    #[arg(long)]
    pub wait: bool,

    #[command(flatten)]
    pub manager: ManagerArgs,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Instance id
    pub id: String,

    /// Input as JSON or YAML, inline or a file path
    #[arg(long)]
    pub values: String,

    /// Wait for the app's Helm releases to converge
    #[arg(long)]
    pub wait: bool,

    #[command(flatten)]
    pub manager: ManagerArgs,
}

/// Namespace creator for commands that only read the repository
struct ReadOnly;

#[async_trait]
impl NamespaceCreator for ReadOnly {
    async fn create(&self, name: &str) -> dodo_installer::Result<()> {
        Err(dodo_installer::Error::internal(format!(
            "refusing to create namespace {} in read-only mode",
            name
        )))
    }
}

/// Parse `--values`: a file when the path exists, inline text otherwise
pub fn parse_values(input: &str) -> Result<Value> {
    let path = PathBuf::from(input);
    let text = if path.is_file() {
        std::fs::read_to_string(&path)?
    } else {
        input.to_string()
    };
    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let values: Value = serde_yaml::from_str(&text)?;
    match values {
        Value::Object(_) => Ok(values),
        Value::Null => Ok(Value::Object(Default::default())),
        other => Err(Error::validation(format!(
            "values must be a mapping, got {}",
            other
        ))),
    }
}

struct Context {
    manager: AppManager,
    apps: AppRepository,
    client: Option<kube::Client>,
}

impl ManagerArgs {
    fn read_only(&self) -> Result<Context> {
        let manager = AppManager::new(self.repo.open()?, Arc::new(ReadOnly))?;
        Ok(Context {
            manager,
            apps: app_repository(self.apps_dir.as_ref())?,
            client: None,
        })
    }

    async fn writable(&self) -> Result<Context> {
        let client = kube_client(self.kubeconfig.as_ref()).await?;
        let mut manager = AppManager::new(
            self.repo.open()?,
            Arc::new(KubeNamespaceCreator::new(client.clone())),
        )?
        .with_ports(Arc::new(HttpPortAllocatorClient::new()));
        if let Some(addr) = &self.headscale_addr {
            manager = manager.with_vpn(Arc::new(HeadscaleClient::new(addr.clone())));
        }
        if let Some(addr) = &self.reconciler_addr {
            let env = manager.config().await?;
            manager = manager.with_reconciler(
                Arc::new(HttpReconcilerClient::new(addr.clone())),
                env.id.clone(),
                env.id.clone(),
            );
        }
        Ok(Context {
            manager,
            apps: app_repository(self.apps_dir.as_ref())?,
            client: Some(client),
        })
    }
}

impl Context {
    async fn wait(&self, resources: &ReleaseResources) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let monitor = ReleaseMonitor::new(Arc::new(HelmReleaseStatus::new(client.clone())));
        let task = monitor.monitor_task(&resources.helm);
        report_progress(&task);
        task.run().await.cmd_err()
    }
}

pub async fn run(cmd: AppCommands) -> Result<()> {
    match cmd {
        AppCommands::Catalog(args) => {
            let apps = app_repository(args.apps_dir.as_ref())?;
            for app in apps.env_apps() {
                println!("{}\t{}", app.slug, app.description);
            }
            Ok(())
        }
        AppCommands::List(args) => {
            let ctx = args.read_only()?;
            for instance in ctx.manager.find_all().await? {
                println!("{}\t{}", instance.id, instance.app_id);
            }
            Ok(())
        }
        AppCommands::Show { id, manager } => {
            let ctx = manager.read_only()?;
            let instance = ctx.manager.find_instance(&id).await?;
            print!("{}", serde_yaml::to_string(&instance)?);
            Ok(())
        }
        AppCommands::Install(args) => install(args).await,
        AppCommands::Update(args) => update(args).await,
        AppCommands::Remove { id, manager } => {
            let ctx = manager.writable().await?;
            ctx.manager.remove(&id).await?;
            ctx.manager.wait_reconciled().await;
            info!(instance = %id, "Removed");
            Ok(())
        }
    }
}

async fn install(args: InstallArgs) -> Result<()> {
    let values = parse_values(&args.values)?;
    let ctx = args.manager.writable().await?;
    let template = ctx.apps.find_env_app(&args.app)?;
    let env = ctx.manager.config().await?;

    let id = args
        .id
        .unwrap_or_else(|| AppManager::generate_instance_id(&template.slug));
    let app_dir = format!("{}/{}", APPS_DIR, id);
    let namespace = env.namespace(&template.namespace);
    let resources = ctx
        .manager
        .install(
            template,
            &id,
            &app_dir,
            &namespace,
            &values,
            InstallOptions::default(),
        )
        .await?;
    ctx.manager.wait_reconciled().await;
    info!(instance = %id, namespace = %namespace, "Installed");
    println!("{}", id);

    if args.wait {
        ctx.wait(&resources).await?;
    }
    Ok(())
}

async fn update(args: UpdateArgs) -> Result<()> {
    let values = parse_values(&args.values)?;
    let ctx = args.manager.writable().await?;
    let instance = ctx.manager.find_instance(&args.id).await?;
    let template = ctx.apps.find(&instance.app_id)?;
    let resources = ctx
        .manager
        .update(template, &args.id, &values, InstallOptions::default())
        .await?;
    ctx.manager.wait_reconciled().await;
    info!(instance = %args.id, "Updated");

    if args.wait {
        ctx.wait(&resources).await?;
    }
    Ok(())
}
