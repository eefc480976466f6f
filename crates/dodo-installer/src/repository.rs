//! Catalog of installable app templates
//!
//! Packages ship inside the binary; a directory of packages on disk can add
//! more or replace shipped ones with the same slug.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::template::{AppKind, AppTemplate};

const APP_FILE: &str = "app.yaml";
const RESOURCES_DIR: &str = "resources";
const ICON_FILE: &str = "icon.svg";

struct EmbeddedApp {
    app_yaml: &'static str,
    resources: &'static [(&'static str, &'static str)],
    icon: Option<&'static str>,
}

macro_rules! embedded_app {
    ($slug:literal, [$($res:literal),+ $(,)?]) => {
        embedded_app!($slug, [$($res),+], None)
    };
    ($slug:literal, [$($res:literal),+ $(,)?], icon) => {
        embedded_app!(
            $slug,
            [$($res),+],
            Some(include_str!(concat!("../apps/", $slug, "/icon.svg")))
        )
    };
    ($slug:literal, [$($res:literal),+ $(,)?], $icon:expr) => {
        EmbeddedApp {
            app_yaml: include_str!(concat!("../apps/", $slug, "/app.yaml")),
            resources: &[$(
                ($res, include_str!(concat!("../apps/", $slug, "/resources/", $res))),
            )+],
            icon: $icon,
        }
    };
}

const EMBEDDED: &[EmbeddedApp] = &[
    embedded_app!("vaultwarden", ["vaultwarden.yaml"], icon),
    embedded_app!("gerrit", ["gerrit.yaml", "ssh-key.yaml"]),
    embedded_app!("vpn-gateway", ["gateway.yaml"]),
    embedded_app!("network", ["certificate.yaml"]),
    embedded_app!("resource-renderer-controller", ["controller.yaml"]),
    embedded_app!("headscale-controller", ["controller.yaml"]),
    embedded_app!("csi-driver-smb", ["driver.yaml"]),
    embedded_app!("cert-manager", ["cert-manager.yaml", "issuer.yaml"]),
    embedded_app!("ingress-public", ["ingress.yaml", "port-allocator.yaml"]),
    embedded_app!("fluxcd-reconciler", ["reconciler.yaml"]),
    embedded_app!("dns-gateway", ["gateway.yaml"]),
    embedded_app!("env-manager", ["env-manager.yaml"]),
];

/// App templates by slug
#[derive(Clone, Debug, Default)]
pub struct AppRepository {
    apps: BTreeMap<String, AppTemplate>,
}

impl AppRepository {
    /// Repository of the packages shipped with the binary
    pub fn embedded() -> Result<Self> {
        let mut repo = Self::default();
        for app in EMBEDDED {
            let resources = app
                .resources
                .iter()
                .map(|(name, text)| (name.to_string(), text.to_string()));
            let template =
                AppTemplate::from_package(app.app_yaml, resources, app.icon.map(str::to_string))?;
            repo.insert(template);
        }
        Ok(repo)
    }

    /// Add every package under `dir`, replacing templates with the same slug
    pub fn with_dir(mut self, dir: &Path) -> Result<Self> {
        for template in load_dir(dir)? {
            if self.apps.contains_key(&template.slug) {
                info!(app = %template.slug, dir = %dir.display(), "Overriding shipped app");
            }
            self.insert(template);
        }
        Ok(self)
    }

    /// Add a single template
    pub fn insert(&mut self, template: AppTemplate) {
        self.apps.insert(template.slug.clone(), template);
    }

    /// Template by slug
    pub fn find(&self, slug: &str) -> Result<&AppTemplate> {
        self.apps
            .get(slug)
            .ok_or_else(|| Error::AppNotFound(slug.to_string()))
    }

    /// Every template, ordered by slug
    pub fn get_all(&self) -> Vec<&AppTemplate> {
        self.apps.values().collect()
    }

    /// Env app by slug
    pub fn find_env_app(&self, slug: &str) -> Result<&AppTemplate> {
        self.find_kind(slug, AppKind::Env)
    }

    /// Infra app by slug
    pub fn find_infra_app(&self, slug: &str) -> Result<&AppTemplate> {
        self.find_kind(slug, AppKind::Infra)
    }

    /// Every env app, ordered by slug
    pub fn env_apps(&self) -> Vec<&AppTemplate> {
        self.of_kind(AppKind::Env)
    }

    /// Every infra app, ordered by slug
    pub fn infra_apps(&self) -> Vec<&AppTemplate> {
        self.of_kind(AppKind::Infra)
    }

    fn find_kind(&self, slug: &str, kind: AppKind) -> Result<&AppTemplate> {
        self.find(slug)
            .ok()
            .filter(|t| t.kind == kind)
            .ok_or_else(|| Error::AppNotFound(slug.to_string()))
    }

    fn of_kind(&self, kind: AppKind) -> Vec<&AppTemplate> {
        self.apps.values().filter(|t| t.kind == kind).collect()
    }
}

/// Load every package directory under `dir`
pub fn load_dir(dir: &Path) -> Result<Vec<AppTemplate>> {
    let mut templates = Vec::new();
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if !path.join(APP_FILE).is_file() {
            continue;
        }
        let template = load_package(&path)?;
        debug!(app = %template.slug, path = %path.display(), "Loaded app package");
        templates.push(template);
    }
    Ok(templates)
}

fn load_package(dir: &Path) -> Result<AppTemplate> {
    let app_yaml = fs::read_to_string(dir.join(APP_FILE))?;
    let resources_dir = dir.join(RESOURCES_DIR);
    let mut resources = Vec::new();
    if resources_dir.is_dir() {
        for entry in fs::read_dir(&resources_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            resources.push((name, fs::read_to_string(entry.path())?));
        }
    }
    let icon_path = dir.join(ICON_FILE);
    let icon = if icon_path.is_file() {
        Some(fs::read_to_string(icon_path)?)
    } else {
        None
    };
    AppTemplate::from_package(&app_yaml, resources, icon).map_err(|e| match e {
        Error::InvalidPackage { message, .. } => {
            Error::invalid_package(dir.display().to_string(), message)
        }
        other => other,
    })
}
