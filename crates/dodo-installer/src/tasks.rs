//! Tree of observable asynchronous tasks
//!
//! Installs and bootstraps are reported to the operator as a tree: leaves do
//! the work, sequential parents run children in order and stop at the first
//! failure, concurrent parents run all children and fail with the first
//! error once every child has finished.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Error;

/// Lifecycle of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Not started
    Pending,
    /// Started, not finished
    Running,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
}

impl Status {
    /// Done or failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Error a task finished with
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TaskError(pub String);

impl From<Error> for TaskError {
    fn from(e: Error) -> Self {
        Self(e.to_string())
    }
}

impl From<&str> for TaskError {
    fn from(e: &str) -> Self {
        Self(e.to_string())
    }
}

type TaskResult = Result<(), TaskError>;
type LeafFn = Box<dyn FnOnce() -> BoxFuture<'static, TaskResult> + Send>;
type Listener = Box<dyn FnOnce(Option<&TaskError>) + Send>;

enum Body {
    Leaf(Mutex<Option<LeafFn>>),
    Sequential(Vec<Task>),
    Concurrent(Vec<Task>),
}

struct State {
    status: Status,
    error: Option<TaskError>,
    listeners: Vec<Listener>,
}

struct Inner {
    title: String,
    body: Body,
    state: Mutex<State>,
    started: AtomicBool,
    done: watch::Sender<bool>,
}

/// Handle to a task; clones share the task
#[derive(Clone)]
pub struct Task(Arc<Inner>);

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("title", &self.0.title)
            .field("status", &self.status())
            .field("children", &self.children().len())
            .finish()
    }
}

impl Task {
    fn with_body(title: impl Into<String>, body: Body) -> Self {
        let (done, _) = watch::channel(false);
        Self(Arc::new(Inner {
            title: title.into(),
            body,
            state: Mutex::new(State {
                status: Status::Pending,
                error: None,
                listeners: Vec::new(),
            }),
            started: AtomicBool::new(false),
            done,
        }))
    }

    /// Task running `f`
    pub fn leaf<F, Fut>(title: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let f: LeafFn = Box::new(move || f().boxed());
        Self::with_body(title, Body::Leaf(Mutex::new(Some(f))))
    }

    /// Task running `children` one after another
    pub fn sequential(title: impl Into<String>, children: Vec<Task>) -> Self {
        Self::with_body(title, Body::Sequential(children))
    }

    /// Task running `children` at the same time
    pub fn concurrent(title: impl Into<String>, children: Vec<Task>) -> Self {
        Self::with_body(title, Body::Concurrent(children))
    }

    /// Title shown to the operator
    pub fn title(&self) -> &str {
        &self.0.title
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.0.state.lock().status
    }

    /// Error the task failed with
    pub fn error(&self) -> Option<TaskError> {
        self.0.state.lock().error.clone()
    }

    /// Subtasks, empty for leaves
    pub fn children(&self) -> &[Task] {
        match &self.0.body {
            Body::Leaf(_) => &[],
            Body::Sequential(c) | Body::Concurrent(c) => c,
        }
    }

    /// Call `f` once the task finishes; immediately if it already has
    pub fn on_done<F>(&self, f: F)
    where
        F: FnOnce(Option<&TaskError>) + Send + 'static,
    {
        let mut state = self.0.state.lock();
        if state.status.is_terminal() {
            let error = state.error.clone();
            drop(state);
            f(error.as_ref());
        } else {
            state.listeners.push(Box::new(f));
        }
    }

    /// Start the task in the background; later calls do nothing
    pub fn start(&self) {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.state.lock().status = Status::Running;
        debug!(task = %self.0.title, "Task started");
        let task = self.clone();
        tokio::spawn(async move {
            let result = task.execute().await;
            task.finish(result);
        });
    }

    /// Wait for the task to finish
    pub async fn wait(&self) -> TaskResult {
        let mut done = self.0.done.subscribe();
        // The sender lives as long as the task, so this only fails if the
        // handle itself is gone.
        let _ = done.wait_for(|finished| *finished).await;
        match self.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start and wait
    pub async fn run(&self) -> TaskResult {
        self.start();
        self.wait().await
    }

    fn execute(&self) -> BoxFuture<'static, TaskResult> {
        let task = self.clone();
        async move {
            match &task.0.body {
                Body::Leaf(f) => {
                    let f = f.lock().take();
                    match f {
                        Some(f) => f().await,
                        None => Err(TaskError("task already ran".to_string())),
                    }
                }
                Body::Sequential(children) => {
                    for child in children {
                        child.run().await?;
                    }
                    Ok(())
                }
                Body::Concurrent(children) => {
                    let mut running: FuturesUnordered<_> =
                        children.iter().map(|c| c.run()).collect();
                    let mut first_error = None;
                    while let Some(result) = running.next().await {
                        if let Err(e) = result {
                            first_error.get_or_insert(e);
                        }
                    }
                    first_error.map_or(Ok(()), Err)
                }
            }
        }
        .boxed()
    }

    fn finish(&self, result: TaskResult) {
        let listeners = {
            let mut state = self.0.state.lock();
            match &result {
                Ok(()) => state.status = Status::Done,
                Err(e) => {
                    warn!(task = %self.0.title, error = %e, "Task failed");
                    state.status = Status::Failed;
                    state.error = Some(e.clone());
                }
            }
            std::mem::take(&mut state.listeners)
        };
        let error = result.err();
        for listener in listeners {
            listener(error.as_ref());
        }
        self.0.done.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn ok(title: &str) -> Task {
        Task::leaf(title, || async { Ok(()) })
    }

    fn counting(title: &str, runs: Arc<AtomicUsize>) -> Task {
        Task::leaf(title, move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn sequential_parent_stops_at_first_failure() {
        let third_runs = Arc::new(AtomicUsize::new(0));
        let parent = Task::sequential(
            "install",
            vec![
                ok("first"),
                Task::leaf("second", || async { Err(TaskError::from("boom")) }),
                counting("third", Arc::clone(&third_runs)),
            ],
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        parent.on_done(move |err| {
            assert_eq!(err.map(|e| e.0.as_str()), Some("boom"));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let err = parent.run().await.expect_err("fails");
        assert_eq!(err, TaskError::from("boom"));
        let children = parent.children();
        assert_eq!(children[0].status(), Status::Done);
        assert_eq!(children[1].status(), Status::Failed);
        assert_eq!(children[2].status(), Status::Pending);
        assert_eq!(parent.status(), Status::Failed);
        assert_eq!(third_runs.load(Ordering::SeqCst), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_added_after_completion_fires_immediately() {
        let task = ok("done");
        task.run().await.expect("run");
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        task.on_done(move |err| {
            assert!(err.is_none());
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting("once", Arc::clone(&runs));
        task.start();
        task.start();
        task.run().await.expect("run");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.status(), Status::Done);
    }

    #[tokio::test]
    async fn concurrent_parent_waits_for_all_children() {
        let slow_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&slow_runs);
        let parent = Task::concurrent(
            "monitor",
            vec![
                Task::leaf("fails", || async { Err(TaskError::from("not ready")) }),
                Task::leaf("slow", move || async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ],
        );
        let err = parent.run().await.expect_err("fails");
        assert_eq!(err.0, "not ready");
        assert_eq!(slow_runs.load(Ordering::SeqCst), 1);
        assert_eq!(parent.children()[1].status(), Status::Done);
    }

    #[tokio::test]
    async fn waiting_on_a_running_task_sees_its_result() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = Task::leaf("gated", move || async move {
            rx.await.map_err(|_| TaskError::from("gate dropped"))
        });
        task.start();
        assert_eq!(task.status(), Status::Running);
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.wait().await })
        };
        tx.send(()).expect("send");
        waiter.await.expect("join").expect("done");
        assert_eq!(task.status(), Status::Done);
    }
}
