//! `kustomization.yaml` documents and the parent chain that links an app
//! directory into the repository root

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fs::RepoFs;

/// File name of a kustomization inside a directory
pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

const API_VERSION: &str = "kustomize.config.k8s.io/v1beta1";
const KIND: &str = "Kustomization";

/// Minimal kustomize document listing its resources
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    /// Always `kustomize.config.k8s.io/v1beta1`
    pub api_version: String,
    /// Always `Kustomization`
    pub kind: String,
    /// Files and directories included by this kustomization
    #[serde(default)]
    pub resources: Vec<String>,
}

impl Default for Kustomization {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            resources: Vec::new(),
        }
    }
}

impl Kustomization {
    /// Kustomization over the given resources
    pub fn with_resources<I, S>(resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut k = Self::default();
        k.add_resources(resources);
        k
    }

    /// Append resources that are not listed yet
    pub fn add_resources<I, S>(&mut self, resources: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for r in resources {
            let r = r.into();
            if !self.resources.contains(&r) {
                self.resources.push(r);
            }
        }
    }

    /// Drop every listed resource equal to one of `resources`
    pub fn remove_resources<I, S>(&mut self, resources: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<S> = resources.into_iter().collect();
        self.resources
            .retain(|r| !removed.iter().any(|d| d.as_ref() == r.as_str()));
    }

    /// True if `resource` is listed
    pub fn contains(&self, resource: &str) -> bool {
        self.resources.iter().any(|r| r == resource)
    }
}

/// Path of the kustomization file inside `dir`
pub fn kustomization_path(dir: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), KUSTOMIZATION_FILE)
}

/// Read `dir/kustomization.yaml`, or an empty kustomization when absent
pub fn read_or_default(fs: &RepoFs, dir: &str) -> Result<Kustomization> {
    let path = kustomization_path(dir);
    if fs.exists(&path)? {
        fs.read_yaml(&path)
    } else {
        Ok(Kustomization::default())
    }
}

/// Make every ancestor of `dir` list its child, up to the repository root.
///
/// For `/apps/foo/resources` this lists `resources` in
/// `/apps/foo/kustomization.yaml`, `foo` in `/apps/kustomization.yaml` and
/// `apps` in `/kustomization.yaml`.
pub fn create_chain(fs: &RepoFs, dir: &str) -> Result<()> {
    let mut current = Path::new("/").join(dir.trim_start_matches('/'));
    while let (Some(parent), Some(child)) = (current.parent(), current.file_name()) {
        let parent_str = parent.to_string_lossy().into_owned();
        let child_str = child.to_string_lossy().into_owned();

        let mut k = read_or_default(fs, &parent_str)?;
        if !k.contains(&child_str) {
            k.add_resources([child_str]);
            fs.write_yaml(&kustomization_path(&parent_str), &k)?;
        }
        current = parent.to_path_buf();
    }
    Ok(())
}

/// Remove `child` from `dir/kustomization.yaml` if the file exists
pub fn unlink(fs: &RepoFs, dir: &str, child: &str) -> Result<()> {
    let path = kustomization_path(dir);
    if !fs.exists(&path)? {
        return Ok(());
    }
    let mut k: Kustomization = fs.read_yaml(&path)?;
    k.remove_resources([child]);
    fs.write_yaml(&path, &k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_resources_dedupes_and_keeps_order() {
        let mut k = Kustomization::with_resources(["b.yaml", "a.yaml"]);
        k.add_resources(["a.yaml", "c.yaml"]);
        assert_eq!(k.resources, vec!["b.yaml", "a.yaml", "c.yaml"]);
        k.remove_resources(["a.yaml"]);
        assert_eq!(k.resources, vec!["b.yaml", "c.yaml"]);
    }

    #[test]
    fn serializes_with_camel_case_header() {
        let yaml = serde_yaml::to_string(&Kustomization::with_resources(["flux"])).expect("yaml");
        assert_eq!(
            yaml,
            "apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nresources:\n- flux\n"
        );
    }

    #[test]
    fn chain_links_every_ancestor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = RepoFs::new(dir.path());
        fs.write_yaml(
            "/kustomization.yaml",
            &Kustomization::with_resources(["env-flux"]),
        )
        .expect("root");

        create_chain(&fs, "/apps/foo-abcdef/resources").expect("chain");
        create_chain(&fs, "/apps/bar-ghijkl/resources").expect("chain");

        let root: Kustomization = fs.read_yaml("/kustomization.yaml").expect("root");
        assert_eq!(root.resources, vec!["env-flux", "apps"]);
        let apps: Kustomization = fs.read_yaml("/apps/kustomization.yaml").expect("apps");
        assert_eq!(apps.resources, vec!["foo-abcdef", "bar-ghijkl"]);
        let app: Kustomization = fs
            .read_yaml("/apps/foo-abcdef/kustomization.yaml")
            .expect("app");
        assert_eq!(app.resources, vec!["resources"]);
    }

    #[test]
    fn unlink_removes_child_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = RepoFs::new(dir.path());
        create_chain(&fs, "/apps/foo/resources").expect("chain");
        create_chain(&fs, "/apps/bar/resources").expect("chain");

        unlink(&fs, "/apps", "foo").expect("unlink");
        let apps: Kustomization = fs.read_yaml("/apps/kustomization.yaml").expect("apps");
        assert_eq!(apps.resources, vec!["bar"]);
        unlink(&fs, "/missing", "foo").expect("missing parent is fine");
    }
}
