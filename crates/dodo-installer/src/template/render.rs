//! Rendering resource templates into manifests

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dodo_common::template::TemplateEngine;
use dodo_common::{yaml, INSTALLER_INFO_ANNOTATION};

use crate::error::{Error, Result};

/// Kind of the documents that releases are extracted from
pub const HELM_RELEASE_KIND: &str = "HelmRelease";

/// Identity of a Helm release produced by an install
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseRef {
    /// Always [`HELM_RELEASE_KIND`] today
    pub kind: String,
    /// Release namespace
    pub namespace: String,
    /// Release name
    pub name: String,
    /// Human readable description
    pub info: String,
}

impl ReleaseRef {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Port forward requested by a template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    /// Network whose ingress opens the port
    pub network: String,
    /// `tcp` or `udp`
    pub protocol: String,
    /// Requested ingress port, picked by the allocator when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    /// Service receiving the traffic
    pub target_service: String,
    /// Port on that service
    pub target_port: u16,
}

/// Output of rendering one app
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rendered {
    /// Manifest text per path relative to the app's resources directory
    pub resources: BTreeMap<String, String>,
    /// Helm releases among the rendered documents
    pub helm: Vec<ReleaseRef>,
    /// Port forwards to open
    pub ports: Vec<PortForward>,
}

/// Render `resources` and `ports` with `ctx`.
///
/// Documents without a namespace are attributed to `default_namespace`
/// when checking for duplicates.
pub fn render(
    engine: &TemplateEngine,
    resources: &BTreeMap<String, String>,
    ports: &[BTreeMap<String, Value>],
    ctx: &Value,
    default_namespace: &str,
) -> Result<Rendered> {
    let mut rendered = Rendered::default();
    let mut seen = BTreeSet::new();

    for (path, template) in resources {
        let text = engine
            .render(template, ctx)
            .map_err(|e| Error::render(path.clone(), e))?;
        for doc in parse_documents(path, &text)? {
            let Some(kind) = yaml::get_str(&doc, "kind") else {
                continue;
            };
            let Some(name) = yaml::get_str(&doc, "metadata.name") else {
                continue;
            };
            let namespace = yaml::get_str(&doc, "metadata.namespace").unwrap_or(default_namespace);
            if !seen.insert((kind.to_string(), namespace.to_string(), name.to_string())) {
                return Err(Error::DuplicateResource {
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
            if kind == HELM_RELEASE_KIND {
                let info = yaml::get(&doc, "metadata.annotations")
                    .and_then(|a| a.get(INSTALLER_INFO_ANNOTATION))
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}/{}", namespace, name));
                rendered.helm.push(ReleaseRef {
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    info,
                });
            }
        }
        rendered.resources.insert(path.clone(), text);
    }

    for (i, port) in ports.iter().enumerate() {
        rendered
            .ports
            .push(render_port(engine, port, ctx, &format!("ports[{}]", i))?);
    }
    Ok(rendered)
}

fn parse_documents(path: &str, text: &str) -> Result<Vec<serde_yaml::Value>> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc).map_err(|e| Error::render(path, e))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

fn render_port(
    engine: &TemplateEngine,
    template: &BTreeMap<String, Value>,
    ctx: &Value,
    path: &str,
) -> Result<PortForward> {
    let mut fields = serde_json::Map::new();
    for (key, value) in template {
        let value = match value {
            Value::String(s) => {
                let text = engine
                    .render(s, ctx)
                    .map_err(|e| Error::render(format!("{}.{}", path, key), e))?;
                scalar(&text)
            }
            other => other.clone(),
        };
        if !value.is_null() {
            fields.insert(key.clone(), value);
        }
    }
    serde_json::from_value(Value::Object(fields)).map_err(|e| Error::render(path, e))
}

/// Rendered text back to a JSON scalar: numbers stay numbers, empty is null
fn scalar(text: &str) -> Value {
    let text = text.trim();
    if text.is_empty() {
        return Value::Null;
    }
    match text.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(text.to_string()),
    }
}
