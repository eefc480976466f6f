//! Namespace creation ahead of the reconciler

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use dodo_common::kube_utils::{ensure_namespace, is_already_exists};
use dodo_common::FIELD_MANAGER;

use crate::error::Result;

/// Creates namespaces; an existing namespace is not an error
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceCreator: Send + Sync {
    /// Create `name` unless it already exists
    async fn create(&self, name: &str) -> Result<()>;
}

/// [`NamespaceCreator`] talking to the Kubernetes API
#[derive(Clone)]
pub struct KubeNamespaceCreator {
    client: Client,
    labels: BTreeMap<String, String>,
}

impl KubeNamespaceCreator {
    /// Creator without extra labels
    pub fn new(client: Client) -> Self {
        Self {
            client,
            labels: BTreeMap::new(),
        }
    }

    /// Label every namespace created
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl NamespaceCreator for KubeNamespaceCreator {
    async fn create(&self, name: &str) -> Result<()> {
        match ensure_namespace(&self.client, name, &self.labels, FIELD_MANAGER).await {
            Ok(()) => {
                debug!(namespace = %name, "Namespace ensured");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
