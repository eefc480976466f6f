//! CLI commands

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use kube::Client;
use tracing::{info, warn};

use dodo_gitops::{Git2Backend, GitAuth, RepoStore, DEFAULT_BRANCH};
use dodo_installer::{AppRepository, Task};

use crate::{Error, Result};

pub mod app;
pub mod bootstrap;
pub mod cluster;
pub mod dns;
pub mod port_allocator;
pub mod reconciler;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Where the configuration repository lives
#[derive(Args, Debug, Clone)]
pub struct RepoArgs {
    /// Local clone of the configuration repository
    #[arg(long, env = "DODO_REPO_DIR")]
    pub repo_dir: PathBuf,

    /// SSH address to clone from when `--repo-dir` is not a clone yet
    #[arg(long, env = "DODO_REPO_ADDR")]
    pub repo_addr: Option<String>,

    /// Private key used for fetch and push
    #[arg(long, env = "DODO_SSH_KEY")]
    pub ssh_key: Option<PathBuf>,

    /// Branch to work on
    #[arg(long, default_value = DEFAULT_BRANCH)]
    pub branch: String,
}

impl RepoArgs {
    fn auth(&self) -> GitAuth {
        match &self.ssh_key {
            Some(path) => GitAuth::SshKeyFile(path.clone()),
            None => GitAuth::None,
        }
    }

    /// Open the clone, cloning first if needed
    pub fn open(&self) -> Result<Arc<RepoStore>> {
        let backend = if self.repo_dir.join(".git").exists() {
            Git2Backend::open(&self.repo_dir, &self.branch, self.auth())?
        } else {
            let addr = self.repo_addr.as_deref().ok_or_else(|| {
                Error::validation(format!(
                    "{} is not a clone and no --repo-addr was given",
                    self.repo_dir.display()
                ))
            })?;
            info!(addr, dir = %self.repo_dir.display(), "Cloning configuration repository");
            Git2Backend::clone_repo(addr, &self.repo_dir, &self.branch, self.auth())?
        };
        Ok(RepoStore::new(backend))
    }
}

/// Kubernetes client from `--kubeconfig`, or inferred from the environment
pub async fn kube_client(kubeconfig: Option<&PathBuf>) -> Result<Client> {
    Ok(dodo_common::kube_utils::create_client(kubeconfig.map(|p| p.as_path())).await?)
}

/// Embedded app catalog, extended with packages under `dir`
pub fn app_repository(dir: Option<&PathBuf>) -> Result<AppRepository> {
    let apps = AppRepository::embedded()?;
    Ok(match dir {
        Some(dir) => apps.with_dir(dir)?,
        None => apps,
    })
}

/// Log every node of `task` as it finishes
pub fn report_progress(task: &Task) {
    let title = task.title().to_string();
    task.on_done(move |error| match error {
        Some(e) => warn!(task = %title, error = %e, "Failed"),
        None => info!(task = %title, "Done"),
    });
    for child in task.children() {
        report_progress(child);
    }
}
