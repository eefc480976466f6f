//! Version control backends behind the repo store
//!
//! [`Git2Backend`] drives a real clone through libgit2; [`LocalBackend`]
//! treats a plain directory as the repository and keeps its history in
//! memory, which is what tests and dry runs want.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, CredentialType, ErrorCode, FetchOptions, IndexAddOption, RemoteCallbacks, Repository,
    Signature,
};
use tracing::{debug, info};

use dodo_common::COMMIT_AUTHOR;

use crate::error::{Error, Result};

/// Default branch of the configuration repository
pub const DEFAULT_BRANCH: &str = "master";

const COMMIT_EMAIL: &str = "installer@dodo.cloud";

/// Where a commit should go
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Push `HEAD` to this branch instead of the tracked one
    pub to_branch: Option<String>,
    /// Allow non-fast-forward updates
    pub force: bool,
}

/// Operations the store needs from version control
pub trait GitBackend: Send {
    /// Root of the working tree
    fn workdir(&self) -> &Path;

    /// Address other components can clone the repository from
    fn address(&self) -> &str;

    /// Fetch and fast-forward the working tree
    fn pull(&mut self) -> Result<()>;

    /// Stage everything, commit and push.
    ///
    /// Returns `None` without committing when nothing changed.
    fn commit_and_push(&mut self, message: &str, opts: &PushOptions) -> Result<Option<String>>;
}

/// How to authenticate against the remote
#[derive(Clone, Debug, Default)]
pub enum GitAuth {
    /// Local paths and anonymous transports
    #[default]
    None,
    /// SSH private key on disk
    SshKeyFile(PathBuf),
    /// SSH private key held in memory (PEM)
    SshKey(String),
}

impl GitAuth {
    fn callbacks(&self) -> RemoteCallbacks<'static> {
        let auth = self.clone();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username, allowed| {
            let user = username.unwrap_or("git");
            if allowed.contains(CredentialType::SSH_KEY) {
                match &auth {
                    GitAuth::SshKeyFile(path) => return Cred::ssh_key(user, None, path, None),
                    GitAuth::SshKey(pem) => return Cred::ssh_key_from_memory(user, None, pem, None),
                    GitAuth::None => return Cred::ssh_key_from_agent(user),
                }
            }
            Cred::default()
        });
        callbacks
    }
}

/// libgit2-backed clone of the configuration repository
pub struct Git2Backend {
    repo: Repository,
    workdir: PathBuf,
    address: String,
    branch: String,
    auth: GitAuth,
}

impl Git2Backend {
    /// Clone `address` into `dir` and track `branch`.
    ///
    /// Empty remotes are fine: the branch starts unborn and the first commit
    /// creates it.
    pub fn clone_repo(address: &str, dir: &Path, branch: &str, auth: GitAuth) -> Result<Self> {
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(auth.callbacks());
        let repo = RepoBuilder::new().fetch_options(fetch).clone(address, dir)?;
        info!(address, dir = %dir.display(), "Cloned configuration repository");
        Self::from_repo(repo, address, branch, auth)
    }

    /// Open an existing clone
    pub fn open(dir: &Path, branch: &str, auth: GitAuth) -> Result<Self> {
        let repo = Repository::open(dir)?;
        let address = repo
            .find_remote("origin")?
            .url()
            .unwrap_or_default()
            .to_string();
        Self::from_repo(repo, &address, branch, auth)
    }

    fn from_repo(repo: Repository, address: &str, branch: &str, auth: GitAuth) -> Result<Self> {
        let workdir = repo
            .workdir()
            .ok_or_else(|| Error::Internal("bare repositories have no working tree".into()))?
            .to_path_buf();
        repo.set_head(&format!("refs/heads/{}", branch))?;
        Ok(Self {
            repo,
            workdir,
            address: address.to_string(),
            branch: branch.to_string(),
            auth,
        })
    }

    fn head_commit(&self) -> Result<Option<git2::Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn push(&self, opts: &PushOptions) -> Result<()> {
        let target = opts.to_branch.as_deref().unwrap_or(&self.branch);
        let refspec = format!(
            "{}refs/heads/{}:refs/heads/{}",
            if opts.force { "+" } else { "" },
            self.branch,
            target
        );

        let mut remote = self.repo.find_remote("origin")?;
        let mut rejected: Option<(String, String)> = None;
        {
            let mut callbacks = self.auth.callbacks();
            callbacks.push_update_reference(|reference, status| {
                if let Some(msg) = status {
                    rejected = Some((reference.to_string(), msg.to_string()));
                }
                Ok(())
            });
            let mut push = git2::PushOptions::new();
            push.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut push))?;
        }

        if let Some((reference, message)) = rejected {
            return Err(Error::PushRejected { reference, message });
        }
        debug!(refspec = %refspec, "Pushed");
        Ok(())
    }
}

impl GitBackend for Git2Backend {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn pull(&mut self) -> Result<()> {
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(self.auth.callbacks());
        self.repo
            .find_remote("origin")?
            .fetch::<&str>(&[], Some(&mut fetch), None)?;

        let tracking = format!("refs/remotes/origin/{}", self.branch);
        let fetched = match self.repo.find_reference(&tracking) {
            Ok(r) => r,
            // Nothing has ever been pushed
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let incoming = self.repo.reference_to_annotated_commit(&fetched)?;
        let (analysis, _) = self.repo.merge_analysis(&[&incoming])?;

        if analysis.is_up_to_date() {
            return Ok(());
        }
        if analysis.is_fast_forward() || analysis.is_unborn() {
            let local = format!("refs/heads/{}", self.branch);
            self.repo
                .reference(&local, incoming.id(), true, "pull: fast-forward")?;
            self.repo.set_head(&local)?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::new().force()))?;
            debug!(commit = %incoming.id(), "Fast-forwarded");
            return Ok(());
        }
        Err(Error::Diverged {
            branch: self.branch.clone(),
        })
    }

    fn commit_and_push(&mut self, message: &str, opts: &PushOptions) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = self.head_commit()?;
        let unchanged = match &parent {
            Some(p) => p.tree_id() == tree_id,
            None => index.is_empty(),
        };
        if unchanged {
            debug!(message, "Nothing to commit");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now(COMMIT_AUTHOR, COMMIT_EMAIL)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        drop(parents);
        drop(parent);

        self.push(opts)?;
        info!(commit = %oid, message, "Committed and pushed");
        Ok(Some(oid.to_string()))
    }
}

/// A commit recorded by [`LocalBackend`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalCommit {
    /// Sequential identifier
    pub id: String,
    /// Commit message
    pub message: String,
    /// Branch the commit was "pushed" to
    pub branch: String,
}

/// Plain-directory backend with an in-memory history
pub struct LocalBackend {
    workdir: PathBuf,
    snapshot: BTreeMap<PathBuf, Vec<u8>>,
    commits: Vec<LocalCommit>,
}

impl LocalBackend {
    /// Use `dir` as the working tree; its current contents are the baseline
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let workdir = dir.into();
        fs::create_dir_all(&workdir)?;
        let snapshot = snapshot(&workdir)?;
        Ok(Self {
            workdir,
            snapshot,
            commits: Vec::new(),
        })
    }

    /// Commits made so far, oldest first
    pub fn commits(&self) -> &[LocalCommit] {
        &self.commits
    }
}

impl GitBackend for LocalBackend {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn address(&self) -> &str {
        self.workdir.to_str().unwrap_or_default()
    }

    fn pull(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit_and_push(&mut self, message: &str, opts: &PushOptions) -> Result<Option<String>> {
        let current = snapshot(&self.workdir)?;
        if current == self.snapshot {
            return Ok(None);
        }
        self.snapshot = current;
        let id = format!("local-{}", self.commits.len() + 1);
        self.commits.push(LocalCommit {
            id: id.clone(),
            message: message.to_string(),
            branch: opts
                .to_branch
                .clone()
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        });
        Ok(Some(id))
    }
}

fn snapshot(root: &Path) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                if entry.file_name() != ".git" {
                    pending.push(path);
                }
            } else {
                let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                files.insert(rel, fs::read(&path)?);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_skips_empty_commits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut backend = LocalBackend::new(dir.path()).expect("backend");

        assert_eq!(
            backend
                .commit_and_push("noop", &PushOptions::default())
                .expect("commit"),
            None
        );

        fs::write(dir.path().join("a.txt"), "a").expect("write");
        let id = backend
            .commit_and_push("add a", &PushOptions::default())
            .expect("commit");
        assert_eq!(id.as_deref(), Some("local-1"));
        assert_eq!(backend.commits()[0].message, "add a");
        assert_eq!(backend.commits()[0].branch, DEFAULT_BRANCH);
    }

    #[test]
    fn local_backend_sees_deletions() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), "a").expect("write");
        let mut backend = LocalBackend::new(dir.path()).expect("backend");

        fs::remove_file(dir.path().join("a.txt")).expect("remove");
        let opts = PushOptions {
            to_branch: Some("staging".into()),
            force: false,
        };
        assert!(backend
            .commit_and_push("remove a", &opts)
            .expect("commit")
            .is_some());
        assert_eq!(backend.commits()[0].branch, "staging");
    }

    fn bare_remote() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        Repository::init_bare(dir.path()).expect("init bare");
        let url = dir.path().to_string_lossy().into_owned();
        (dir, url)
    }

    #[test]
    fn git2_backend_commits_and_pushes_to_empty_remote() {
        let (remote_dir, url) = bare_remote();
        let work = tempfile::tempdir().expect("tempdir");
        let mut backend = Git2Backend::clone_repo(&url, &work.path().join("repo"), DEFAULT_BRANCH, GitAuth::None)
            .expect("clone");

        backend.pull().expect("pull from empty remote");
        assert_eq!(
            backend
                .commit_and_push("empty", &PushOptions::default())
                .expect("commit"),
            None
        );

        fs::write(backend.workdir().join("README.md"), "# env").expect("write");
        let id = backend
            .commit_and_push("init", &PushOptions::default())
            .expect("commit")
            .expect("something to commit");

        let remote = Repository::open_bare(remote_dir.path()).expect("open remote");
        let head = remote
            .find_reference("refs/heads/master")
            .expect("branch pushed")
            .peel_to_commit()
            .expect("commit");
        assert_eq!(head.id().to_string(), id);
        assert_eq!(head.message(), Some("init"));
        assert_eq!(head.author().name(), Some(COMMIT_AUTHOR));
    }

    #[test]
    fn second_clone_fast_forwards_on_pull() {
        let (_remote_dir, url) = bare_remote();
        let work = tempfile::tempdir().expect("tempdir");
        let mut first = Git2Backend::clone_repo(&url, &work.path().join("a"), DEFAULT_BRANCH, GitAuth::None)
            .expect("clone a");
        let mut second = Git2Backend::clone_repo(&url, &work.path().join("b"), DEFAULT_BRANCH, GitAuth::None)
            .expect("clone b");

        fs::write(first.workdir().join("config.yaml"), "domain: example.com\n").expect("write");
        first
            .commit_and_push("config", &PushOptions::default())
            .expect("push");

        second.pull().expect("pull");
        assert_eq!(
            fs::read_to_string(second.workdir().join("config.yaml")).expect("pulled"),
            "domain: example.com\n"
        );
    }

    #[test]
    fn stale_clone_push_is_rejected_and_keeps_commit() {
        let (_remote_dir, url) = bare_remote();
        let work = tempfile::tempdir().expect("tempdir");
        let mut first = Git2Backend::clone_repo(&url, &work.path().join("a"), DEFAULT_BRANCH, GitAuth::None)
            .expect("clone a");
        let mut second = Git2Backend::clone_repo(&url, &work.path().join("b"), DEFAULT_BRANCH, GitAuth::None)
            .expect("clone b");

        fs::write(first.workdir().join("a.txt"), "a").expect("write");
        first
            .commit_and_push("from a", &PushOptions::default())
            .expect("push a");

        fs::write(second.workdir().join("b.txt"), "b").expect("write");
        assert!(second
            .commit_and_push("from b", &PushOptions::default())
            .is_err());
        let local_head = second.head_commit().expect("head").expect("committed");
        assert_eq!(local_head.message(), Some("from b"));
    }
}
