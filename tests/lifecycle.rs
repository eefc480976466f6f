//! App lifecycle against a real Git remote
//!
//! Clones an empty bare repository the way the CLI does, seeds the
//! environment configuration, then installs, updates and removes an app,
//! checking what lands on the remote after each step.

use std::sync::Arc;

use async_trait::async_trait;
use git2::Repository;
use parking_lot::Mutex;
use serde_json::json;

use dodo::commands::RepoArgs;
use dodo_gitops::{DoOptions, RepoFs, DEFAULT_BRANCH};
use dodo_installer::env::{EnvConfig, ReservedIps, CONFIG_PATH};
use dodo_installer::{AppManager, AppRepository, InstallOptions, NamespaceCreator};

#[derive(Default)]
struct RecordingNamespaces(Mutex<Vec<String>>);

#[async_trait]
impl NamespaceCreator for RecordingNamespaces {
    async fn create(&self, name: &str) -> dodo_installer::Result<()> {
        self.0.lock().push(name.to_string());
        Ok(())
    }
}

fn env() -> EnvConfig {
    EnvConfig {
        infra_name: "dodo".to_string(),
        id: "example".to_string(),
        namespace_prefix: "example-".to_string(),
        admin_public_key: "ssh-ed25519 AAAAoperator".to_string(),
        public_ip: vec!["135.181.48.180".to_string()],
        domain: "example.com".to_string(),
        private_domain: Some("p.example".to_string()),
        contact_email: None,
        network: ReservedIps::default(),
    }
}

fn remote_log(remote: &Repository) -> Vec<String> {
    let mut walk = remote.revwalk().expect("revwalk");
    walk.push_ref("refs/heads/master").expect("branch pushed");
    walk.map(|oid| {
        let commit = remote.find_commit(oid.expect("oid")).expect("commit");
        commit.message().unwrap_or_default().to_string()
    })
    .collect()
}

fn remote_file(remote: &Repository, path: &str) -> Option<String> {
    let tree = remote
        .find_reference("refs/heads/master")
        .ok()?
        .peel_to_tree()
        .ok()?;
    let entry = tree.get_path(std::path::Path::new(path)).ok()?;
    let blob = remote.find_blob(entry.id()).ok()?;
    Some(String::from_utf8_lossy(blob.content()).into_owned())
}

#[tokio::test]
async fn install_update_remove_through_git_remote() {
    let remote_dir = tempfile::tempdir().expect("tempdir");
    let remote = Repository::init_bare(remote_dir.path()).expect("bare remote");
    let work = tempfile::tempdir().expect("tempdir");

    let args = RepoArgs {
        repo_dir: work.path().join("config"),
        repo_addr: Some(remote_dir.path().to_string_lossy().into_owned()),
        ssh_key: None,
        branch: DEFAULT_BRANCH.to_string(),
    };
    let repo = args.open().expect("clone");
    repo.run(DoOptions::default(), |fs: &RepoFs| {
        fs.write_yaml(CONFIG_PATH, &env())?;
        Ok::<_, dodo_gitops::Error>("init".to_string())
    })
    .expect("seed config");

    let namespaces = Arc::new(RecordingNamespaces::default());
    let manager = AppManager::new(repo, namespaces.clone()).expect("manager");
    let apps = AppRepository::embedded().expect("catalog");
    let vaultwarden = apps.find_env_app("vaultwarden").expect("template");
    let config = manager.config().await.expect("env");

    let namespace = config.namespace(&vaultwarden.namespace);
    assert_eq!(namespace, "example-app-vaultwarden");
    let resources = manager
        .install(
            vaultwarden,
            "vaultwarden-abcdef",
            "/apps/vaultwarden-abcdef",
            &namespace,
            &json!({"network": "Private", "subdomain": "pass"}),
            InstallOptions::default(),
        )
        .await
        .expect("install");
    assert_eq!(resources.helm.len(), 1);
    assert_eq!(resources.helm[0].namespace, "example-app-vaultwarden");
    assert_eq!(*namespaces.0.lock(), vec!["example-app-vaultwarden".to_string()]);

    let manifest = remote_file(&remote, "apps/vaultwarden-abcdef/resources/vaultwarden.yaml")
        .expect("manifest pushed");
    assert!(manifest.contains("ingressClassName: example-ingress-private"));
    assert!(manifest.contains("domain: pass.p.example"));

    manager
        .update(
            vaultwarden,
            "vaultwarden-abcdef",
            &json!({"network": "Private", "subdomain": "vault"}),
            InstallOptions::default(),
        )
        .await
        .expect("update");
    let manifest = remote_file(&remote, "apps/vaultwarden-abcdef/resources/vaultwarden.yaml")
        .expect("manifest pushed");
    assert!(manifest.contains("domain: vault.p.example"));
    let record = manager
        .find_instance("vaultwarden-abcdef")
        .await
        .expect("record");
    assert_eq!(record.config["subdomain"], "vault");

    manager.remove("vaultwarden-abcdef").await.expect("remove");
    assert!(remote_file(&remote, "apps/vaultwarden-abcdef/config.yaml").is_none());
    assert!(manager.find_all().await.expect("list").is_empty());

    let log = remote_log(&remote);
    assert_eq!(log.len(), 4);
    assert_eq!(log.last().map(String::as_str), Some("init"));
    assert!(log[0].starts_with("uninstall: vaultwarden-abcdef"));
}
