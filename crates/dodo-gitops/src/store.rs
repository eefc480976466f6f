//! Serialized read-modify-commit access to the configuration repository
//!
//! Every mutation goes through [`RepoStore::run`]: take the store-wide lock,
//! pull, let the caller edit the working tree, then commit and push the
//! message the caller returned. Two concurrent `run` calls therefore produce
//! two commits on a single parent chain.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::backend::{GitBackend, PushOptions};
use crate::error::Error;
use crate::fs::RepoFs;

/// Options for [`RepoStore::run`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DoOptions {
    /// Skip the pull before invoking the callback
    pub no_pull: bool,
    /// Leave changes in the working tree without committing
    pub no_commit: bool,
    /// Force-push
    pub force: bool,
    /// Push to this branch instead of the tracked one
    pub to_branch: Option<String>,
}

impl DoOptions {
    /// Skip the pull
    pub fn no_pull(mut self) -> Self {
        self.no_pull = true;
        self
    }

    /// Skip the commit
    pub fn no_commit(mut self) -> Self {
        self.no_commit = true;
        self
    }

    /// Force-push
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Push to `branch`
    pub fn to_branch(mut self, branch: impl Into<String>) -> Self {
        self.to_branch = Some(branch.into());
        self
    }
}

/// Thread-safe handle on one clone of the configuration repository
pub struct RepoStore {
    backend: Mutex<Box<dyn GitBackend>>,
    fs: RepoFs,
    address: String,
}

impl RepoStore {
    /// Wrap a backend
    pub fn new(backend: impl GitBackend + 'static) -> Arc<Self> {
        let fs = RepoFs::new(backend.workdir());
        let address = backend.address().to_string();
        Arc::new(Self {
            backend: Mutex::new(Box::new(backend)),
            fs,
            address,
        })
    }

    /// Address the repository can be cloned from
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Working tree directory
    pub fn workdir(&self) -> &Path {
        self.fs.root()
    }

    /// Pull, run `f`, then commit and push the message it returns.
    ///
    /// Returns the new commit id, or `None` when nothing changed or
    /// `no_commit` was set. An error from `f` aborts before committing.
    pub fn run<F, E>(&self, opts: DoOptions, f: F) -> Result<Option<String>, E>
    where
        F: FnOnce(&RepoFs) -> Result<String, E>,
        E: From<Error>,
    {
        self.run_with(opts, |fs| f(fs).map(|message| (message, ())))
            .map(|(commit, ())| commit)
    }

    /// Like [`RepoStore::run`], but `f` also produces a value that is handed
    /// back once the commit has been pushed.
    #[instrument(skip(self, f), fields(repo = %self.address))]
    pub fn run_with<F, T, E>(&self, opts: DoOptions, f: F) -> Result<(Option<String>, T), E>
    where
        F: FnOnce(&RepoFs) -> Result<(String, T), E>,
        E: From<Error>,
    {
        let mut backend = self.backend.lock();
        if !opts.no_pull {
            backend.pull()?;
        }
        let (message, value) = f(&self.fs)?;
        if opts.no_commit {
            debug!(message = %message, "Leaving changes uncommitted");
            return Ok((None, value));
        }
        let push = PushOptions {
            to_branch: opts.to_branch,
            force: opts.force,
        };
        let commit = backend.commit_and_push(&message, &push)?;
        Ok((commit, value))
    }

    /// [`RepoStore::run_with`] on the blocking thread pool
    pub async fn run_with_async<F, T, E>(
        self: &Arc<Self>,
        opts: DoOptions,
        f: F,
    ) -> Result<(Option<String>, T), E>
    where
        F: FnOnce(&RepoFs) -> Result<(String, T), E> + Send + 'static,
        T: Send + 'static,
        E: From<Error> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.run_with(opts, f))
            .await
            .map_err(|e| E::from(Error::Internal(format!("repository task failed: {}", e))))?
    }

    /// [`RepoStore::run`] on the blocking thread pool
    pub async fn run_async<F, E>(
        self: &Arc<Self>,
        opts: DoOptions,
        f: F,
    ) -> Result<Option<String>, E>
    where
        F: FnOnce(&RepoFs) -> Result<String, E> + Send + 'static,
        E: From<Error> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.run(opts, f))
            .await
            .map_err(|e| E::from(Error::Internal(format!("repository task failed: {}", e))))?
    }

    /// Read from the working tree under the lock, optionally pulling first
    pub fn read<F, T, E>(&self, pull: bool, f: F) -> Result<T, E>
    where
        F: FnOnce(&RepoFs) -> Result<T, E>,
        E: From<Error>,
    {
        let mut backend = self.backend.lock();
        if pull {
            backend.pull()?;
        }
        f(&self.fs)
    }

    /// [`RepoStore::read`] on the blocking thread pool
    pub async fn read_async<F, T, E>(self: &Arc<Self>, pull: bool, f: F) -> Result<T, E>
    where
        F: FnOnce(&RepoFs) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<Error> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.read(pull, f))
            .await
            .map_err(|e| E::from(Error::Internal(format!("repository task failed: {}", e))))?
    }
}
