//! App templates and their evaluation
//!
//! Evaluating a template against user input runs four phases:
//!
//! 1. [`derive`] - type-check input, resolve networks, fill in defaults and
//!    generated values
//! 2. [`validate`] - check the derived tree and the template constraints
//! 3. [`render`] - render every resource with `${...}` templating
//! 4. [`project`] - shrink the derived tree back to input shape for storage
//!
//! Any failure surfaces before the configuration repository is written.

pub mod derive;
pub mod project;
pub mod render;
pub mod schema;
pub mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use dodo_common::template::TemplateEngine;

use crate::env::{EnvConfig, Network};
use crate::error::{Error, Result};
use crate::vpn::VpnKeyIssuer;

pub use derive::DeriveContext;
pub use render::{PortForward, ReleaseRef, Rendered};
pub use schema::{Field, Kind, Schema};
pub use validate::Constraint;

/// Who an app is installed for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Installed into an environment by its users
    #[default]
    Env,
    /// Installed once per installation by the bootstrapper
    Infra,
}

/// `app.yaml` of a package
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    name: String,
    #[serde(default)]
    kind: AppKind,
    namespace: String,
    #[serde(default)]
    namespaces: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    schema: Schema,
    #[serde(default)]
    constraints: Vec<Constraint>,
    #[serde(default)]
    ports: Vec<BTreeMap<String, Value>>,
}

/// An immutable app template
#[derive(Clone, Debug, PartialEq)]
pub struct AppTemplate {
    /// Unique identifier
    pub slug: String,
    /// Env or infra
    pub kind: AppKind,
    /// Default namespace, without the environment prefix
    pub namespace: String,
    /// Extra namespaces the app needs
    pub namespaces: Vec<String>,
    /// Short description
    pub description: String,
    /// SVG icon
    pub icon: Option<String>,
    /// Input schema
    pub schema: Schema,
    /// Constraints over the derived input
    pub constraints: Vec<Constraint>,
    /// Port forward templates
    pub ports: Vec<BTreeMap<String, Value>>,
    /// Resource templates keyed by path relative to the resources directory
    pub resources: BTreeMap<String, String>,
}

impl AppTemplate {
    /// Assemble a template from the files of a package
    pub fn from_package<I>(app_yaml: &str, resources: I, icon: Option<String>) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let manifest: Manifest = serde_yaml::from_str(app_yaml)
            .map_err(|e| Error::invalid_package("app.yaml", e.to_string()))?;
        let resources: BTreeMap<String, String> = resources.into_iter().collect();
        if resources.is_empty() {
            return Err(Error::invalid_package(&manifest.name, "package has no resources"));
        }
        Ok(Self {
            slug: manifest.name,
            kind: manifest.kind,
            namespace: manifest.namespace,
            namespaces: manifest.namespaces,
            description: manifest.description,
            icon,
            schema: manifest.schema,
            constraints: manifest.constraints,
            ports: manifest.ports,
            resources,
        })
    }
}

/// Where an app instance lives
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Namespace the app is installed into
    pub namespace: String,
    /// Instance id
    pub app_instance_id: String,
    /// Address of the configuration repository
    pub repo_addr: String,
    /// Directory of the instance inside the repository
    pub app_dir: String,
}

/// Result of evaluating a template
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    /// Derived input
    pub derived: Map<String, Value>,
    /// Derived input projected back to input shape
    pub config: Map<String, Value>,
    /// Rendered manifests and requests
    pub rendered: Rendered,
}

/// Runs the evaluation phases with one template engine
pub struct TemplateEvaluator {
    engine: TemplateEngine,
}

impl TemplateEvaluator {
    /// Evaluator with the standard engine
    pub fn new() -> Result<Self> {
        let engine = TemplateEngine::new().map_err(|e| Error::internal(e.to_string()))?;
        Ok(Self { engine })
    }

    /// Evaluate `template` for `release` with user `values`
    pub async fn evaluate(
        &self,
        template: &AppTemplate,
        release: &Release,
        env: &EnvConfig,
        networks: &[Network],
        values: &Value,
        vpn: Option<&dyn VpnKeyIssuer>,
    ) -> Result<Evaluation> {
        let derived =
            derive::derive(&template.schema, values, DeriveContext { networks, vpn }).await?;

        let mut ctx = json!({
            "release": release,
            "global": env,
            "input": derived,
        });
        validate::unify(
            &template.schema,
            &derived,
            &template.constraints,
            &self.engine,
            &ctx,
        )?;

        if let Value::Object(obj) = &mut ctx {
            obj.insert("networks".to_string(), serde_json::to_value(networks)?);
            obj.insert("ingress".to_string(), ingress_classes(env));
            obj.insert("issuer".to_string(), issuers(env));
        }
        let rendered = render::render(
            &self.engine,
            &template.resources,
            &template.ports,
            &ctx,
            &release.namespace,
        )?;
        debug!(
            app = %template.slug,
            resources = rendered.resources.len(),
            releases = rendered.helm.len(),
            "Rendered app"
        );

        let config = project::project(&template.schema, &derived, values);
        Ok(Evaluation {
            derived,
            config,
            rendered,
        })
    }
}

fn ingress_classes(env: &EnvConfig) -> Value {
    json!({
        "public": format!("{}-ingress-public", env.infra_name),
        "private": format!("{}-ingress-private", env.id),
    })
}

fn issuers(env: &EnvConfig) -> Value {
    json!({
        "public": format!("{}-public", env.id),
        "private": format!("{}-private", env.id),
    })
}
