//! Running commands on cluster nodes
//!
//! Nodes are driven through the `ssh` binary. Key material from the server
//! description is written to a private directory for the lifetime of the
//! connection; password logins go through `sshpass`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::state::Server;

/// A shell on one node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` and return its stdout
    async fn exec(&self, command: &str) -> Result<String>;
}

/// Opens shells on nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connect to `server`
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteShell>>;
}

/// [`ShellConnector`] spawning `ssh`
#[derive(Clone, Debug)]
pub struct SshConnector {
    key_dir: PathBuf,
}

impl SshConnector {
    /// Keep per-node key files under `key_dir`
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
        }
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteShell>> {
        if server.client_key.is_empty() && server.password.is_empty() {
            return Err(Error::InvalidServer(format!(
                "{} has neither a client key nor a password",
                server.ip
            )));
        }
        tokio::fs::create_dir_all(&self.key_dir).await?;
        let stem = server.ip.to_string().replace([':', '.'], "-");

        let mut options = vec![
            "ConnectTimeout=10".to_string(),
            "BatchMode=no".to_string(),
        ];
        if server.host_key.is_empty() {
            options.push("StrictHostKeyChecking=no".into());
            options.push("UserKnownHostsFile=/dev/null".into());
        } else {
            let known_hosts = self.key_dir.join(format!("{}.known_hosts", stem));
            let host = if server.port == 22 {
                server.ip.to_string()
            } else {
                format!("[{}]:{}", server.ip, server.port)
            };
            tokio::fs::write(&known_hosts, format!("{} {}\n", host, server.host_key.trim())).await?;
            options.push("StrictHostKeyChecking=yes".into());
            options.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }

        let identity = if server.client_key.is_empty() {
            None
        } else {
            let path = self.key_dir.join(format!("{}.key", stem));
            write_private(&path, &server.client_key).await?;
            Some(path)
        };

        Ok(Arc::new(SshShell {
            host: format!("{}@{}", server.user, server.ip),
            port: server.port,
            identity,
            password: (!server.password.is_empty()).then(|| server.password.clone()),
            options,
        }))
    }
}

#[cfg(unix)]
async fn write_private(path: &std::path::Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_private(path: &std::path::Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    Ok(())
}

/// Shell over one `ssh` invocation per command
#[derive(Clone, Debug)]
pub struct SshShell {
    host: String,
    port: u16,
    identity: Option<PathBuf>,
    password: Option<String>,
    options: Vec<String>,
}

impl SshShell {
    fn command(&self, remote: &str) -> Command {
        let mut cmd = match (&self.identity, &self.password) {
            (None, Some(password)) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            _ => Command::new("ssh"),
        };
        cmd.args(self.args(remote));
        cmd
    }

    fn args(&self, remote: &str) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.port.to_string()];
        if let Some(identity) = &self.identity {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        for option in &self.options {
            args.push("-o".into());
            args.push(option.clone());
        }
        args.push(self.host.clone());
        args.push(remote.to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<String> {
        debug!(host = %self.host, command, "ssh");
        let output = self.command(command).output().await?;
        if !output.status.success() {
            return Err(Error::command(
                &self.host,
                command,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
