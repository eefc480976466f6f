//! Client for the soft-serve Git server hosting the configuration repository
//!
//! soft-serve is administered over SSH: every operation is a command sent to
//! the server as the admin user. The client shells out to `ssh`, the same way
//! chart installs shell out to `helm`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::backend::{Git2Backend, GitAuth, DEFAULT_BRANCH};
use crate::error::{Error, Result};
use crate::store::RepoStore;

/// Access level of a repository collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    /// Can clone and fetch
    ReadOnly,
    /// Can also push
    ReadWrite,
}

impl Permission {
    fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::ReadWrite => "read-write",
        }
    }
}

/// What the installer needs from the Git server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GitServer: Send + Sync {
    /// Create a user with a single public key
    async fn add_user(&self, name: &str, public_key: &str) -> Result<()>;

    /// Grant admin rights
    async fn make_admin(&self, name: &str) -> Result<()>;

    /// Authorize another key for a user
    async fn add_public_key(&self, user: &str, public_key: &str) -> Result<()>;

    /// Revoke a key
    async fn remove_public_key(&self, user: &str, public_key: &str) -> Result<()>;

    /// Create an empty repository
    async fn add_repository(&self, name: &str) -> Result<()>;

    /// Give `user` access to `repo`
    async fn add_collaborator(&self, repo: &str, user: &str, permission: Permission)
        -> Result<()>;

    /// Deliver push events for `repo` to `url`
    async fn add_webhook(&self, repo: &str, url: &str) -> Result<()>;

    /// Host keys of the server in known_hosts format
    async fn host_public_keys(&self) -> Result<Vec<String>>;

    /// SSH clone address of a repository
    fn repo_address(&self, name: &str) -> String;

    /// Clone a repository into `dir` as the admin user
    async fn clone_repo(&self, name: &str, dir: &Path) -> Result<Arc<RepoStore>>;
}

/// soft-serve over the `ssh` binary
#[derive(Clone, Debug)]
pub struct SoftServeClient {
    host: String,
    port: u16,
    key_path: PathBuf,
}

impl SoftServeClient {
    /// Connect to `host:port` with the admin private key at `key_path`
    pub fn new(host: impl Into<String>, port: u16, key_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            key_path: key_path.into(),
        }
    }

    /// Same server, different identity
    pub fn with_key(&self, key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            ..self.clone()
        }
    }

    fn ssh_args(&self, command: &[&str]) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.host.clone(),
        ];
        args.push(remote_command(command));
        args
    }

    async fn exec(&self, command: &[&str]) -> Result<String> {
        let rendered = remote_command(command);
        debug!(command = %rendered, host = %self.host, "soft-serve");
        let output = Command::new("ssh").args(self.ssh_args(command)).output().await?;
        if !output.status.success() {
            return Err(Error::command(
                rendered,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Join arguments into one remote command line, single-quoting any argument
/// that is not a plain word (public keys contain spaces).
fn remote_command(args: &[&str]) -> String {
    args.iter()
        .map(|a| {
            let plain = !a.is_empty()
                && a.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c));
            if plain {
                a.to_string()
            } else {
                format!("'{}'", a.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl GitServer for SoftServeClient {
    async fn add_user(&self, name: &str, public_key: &str) -> Result<()> {
        self.exec(&["user", "create", name, "-k", public_key]).await?;
        info!(user = %name, "Created git user");
        Ok(())
    }

    async fn make_admin(&self, name: &str) -> Result<()> {
        self.exec(&["user", "set-admin", name, "true"]).await?;
        Ok(())
    }

    async fn add_public_key(&self, user: &str, public_key: &str) -> Result<()> {
        self.exec(&["user", "add-pubkey", user, public_key]).await?;
        Ok(())
    }

    async fn remove_public_key(&self, user: &str, public_key: &str) -> Result<()> {
        self.exec(&["user", "remove-pubkey", user, public_key])
            .await?;
        Ok(())
    }

    async fn add_repository(&self, name: &str) -> Result<()> {
        self.exec(&["repo", "create", name]).await?;
        info!(repo = %name, "Created repository");
        Ok(())
    }

    async fn add_collaborator(
        &self,
        repo: &str,
        user: &str,
        permission: Permission,
    ) -> Result<()> {
        self.exec(&["repo", "collab", "add", repo, user, permission.as_str()])
            .await?;
        Ok(())
    }

    async fn add_webhook(&self, repo: &str, url: &str) -> Result<()> {
        self.exec(&[
            "repo",
            "webhook",
            "create",
            repo,
            url,
            "-e=push",
            "-c=json",
            "--active=true",
        ])
        .await?;
        Ok(())
    }

    async fn host_public_keys(&self) -> Result<Vec<String>> {
        let output = Command::new("ssh-keyscan")
            .args(["-p", &self.port.to_string(), &self.host])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::command(
                "ssh-keyscan",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let keys = parse_keyscan(&String::from_utf8_lossy(&output.stdout));
        if keys.is_empty() {
            return Err(Error::command("ssh-keyscan", "server returned no host keys"));
        }
        Ok(keys)
    }

    fn repo_address(&self, name: &str) -> String {
        format!("ssh://{}:{}/{}", self.host, self.port, name)
    }

    async fn clone_repo(&self, name: &str, dir: &Path) -> Result<Arc<RepoStore>> {
        let address = self.repo_address(name);
        let dir = dir.to_path_buf();
        let auth = GitAuth::SshKeyFile(self.key_path.clone());
        let backend = tokio::task::spawn_blocking(move || {
            Git2Backend::clone_repo(&address, &dir, DEFAULT_BRANCH, auth)
        })
        .await
        .map_err(|e| Error::Internal(format!("clone task failed: {}", e)))??;
        Ok(RepoStore::new(backend))
    }
}

fn parse_keyscan(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}
