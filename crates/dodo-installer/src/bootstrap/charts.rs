//! Installing Helm charts from a local charts directory

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Helm timeout for bootstrap installs
pub const HELM_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// One `helm install`
#[derive(Clone, Debug, PartialEq)]
pub struct ChartRelease {
    /// Release name
    pub name: String,
    /// Chart directory name under the charts directory
    pub chart: String,
    /// Namespace of the release
    pub namespace: String,
    /// Create the namespace when missing
    pub create_namespace: bool,
    /// Install CRDs shipped with the chart
    pub include_crds: bool,
    /// Chart values
    pub values: Value,
}

impl ChartRelease {
    /// Release `name` of `chart` in `namespace`
    pub fn new(
        name: impl Into<String>,
        chart: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            chart: chart.into(),
            namespace: namespace.into(),
            create_namespace: true,
            include_crds: false,
            values: Value::Object(Default::default()),
        }
    }

    /// Use `values`
    pub fn values(mut self, values: Value) -> Self {
        self.values = values;
        self
    }

    /// Install into an existing namespace only
    pub fn existing_namespace(mut self) -> Self {
        self.create_namespace = false;
        self
    }

    /// Install CRDs too
    pub fn with_crds(mut self) -> Self {
        self.include_crds = true;
        self
    }
}

/// Installs chart releases and waits for them
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Install `release`; an existing release with the same name is an error
    async fn install(&self, release: &ChartRelease) -> Result<()>;
}

/// [`ChartInstaller`] running the `helm` binary
#[derive(Clone, Debug)]
pub struct HelmChartInstaller {
    charts_dir: PathBuf,
    timeout: Duration,
}

impl HelmChartInstaller {
    /// Install charts found under `charts_dir`
    pub fn new(charts_dir: impl Into<PathBuf>) -> Self {
        Self {
            charts_dir: charts_dir.into(),
            timeout: HELM_TIMEOUT,
        }
    }

    fn args(&self, release: &ChartRelease) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            release.name.clone(),
            self.charts_dir.join(&release.chart).display().to_string(),
            "--namespace".to_string(),
            release.namespace.clone(),
            "--wait".to_string(),
            "--wait-for-jobs".to_string(),
            "--timeout".to_string(),
            helm_duration(self.timeout),
            "--values".to_string(),
            "-".to_string(),
        ];
        if release.create_namespace {
            args.push("--create-namespace".to_string());
        }
        if !release.include_crds {
            args.push("--skip-crds".to_string());
        }
        args
    }
}

/// `20m0s` style duration
fn helm_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}m{}s", secs / 60, secs % 60)
}

#[async_trait]
impl ChartInstaller for HelmChartInstaller {
    async fn install(&self, release: &ChartRelease) -> Result<()> {
        let args = self.args(release);
        let command = format!("helm {}", args.join(" "));
        let values = serde_yaml::to_string(&release.values)?;
        debug!(command = %command, "Installing chart");

        let mut child = Command::new("helm")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(values.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::command(
                command,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        info!(release = %release.name, namespace = %release.namespace, "Chart installed");
        Ok(())
    }
}
