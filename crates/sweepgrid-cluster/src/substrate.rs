//! The execution substrate seam.
//!
//! A substrate knows which nodes are live, can run a shell command on one
//! of them, and can run a task there asynchronously.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::select_all;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::ClusterResult;

/// Boxed future returned by substrate calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Node identifier, `user@ip`.
pub type NodeId = String;

/// The work shipped to a node. Runs on a blocking thread.
pub type Job = Box<dyn FnOnce() -> anyhow::Result<Value> + Send + 'static>;

pub struct RemoteTask {
    pub task_id: String,
    pub job: Job,
}

impl RemoteTask {
    pub fn new<F>(task_id: impl Into<String>, job: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        Self {
            task_id: task_id.into(),
            job: Box::new(job),
        }
    }
}

/// Result of a finished task.
#[derive(Debug)]
pub struct Completed {
    pub task_id: String,
    pub node: NodeId,
    pub result: anyhow::Result<Value>,
}

/// Pending result of a dispatched [`RemoteTask`].
pub struct TaskHandle {
    pub task_id: String,
    pub node: NodeId,
    rx: oneshot::Receiver<anyhow::Result<Value>>,
}

impl TaskHandle {
    /// Create a handle and the sender a substrate completes it with.
    pub fn channel(
        task_id: impl Into<String>,
        node: impl Into<NodeId>,
    ) -> (Self, oneshot::Sender<anyhow::Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            task_id: task_id.into(),
            node: node.into(),
            rx,
        };
        (handle, tx)
    }

    /// The result if the task has finished, without waiting.
    pub fn try_complete(&mut self) -> Option<Completed> {
        let result = match self.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(self.dropped()),
        };
        Some(self.completed(result))
    }

    fn completed(&self, result: anyhow::Result<Value>) -> Completed {
        Completed {
            task_id: self.task_id.clone(),
            node: self.node.clone(),
            result,
        }
    }

    fn dropped(&self) -> anyhow::Error {
        anyhow::anyhow!("task {} on {} was dropped before completing", self.task_id, self.node)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("node", &self.node)
            .finish()
    }
}

impl Future for TaskHandle {
    type Output = Completed;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(self.completed(result)),
            Poll::Ready(Err(_)) => {
                let err = self.dropped();
                Poll::Ready(self.completed(Err(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A set of compute nodes that can run commands and tasks.
pub trait Substrate: Send + Sync {
    fn is_started(&self) -> bool;

    /// The node the scheduler itself runs on.
    fn head_node(&self) -> NodeId;

    /// Currently live nodes. Fails with `Unavailable` when not started.
    fn discover_nodes(&self) -> ClusterResult<BTreeSet<NodeId>>;

    /// Run a shell command on `node` and return its stdout.
    fn run_remote(
        &self,
        node: &str,
        command: &str,
        timeout: Duration,
    ) -> BoxFuture<'static, anyhow::Result<String>>;

    /// Start `task` on `node`; returns without waiting for it.
    fn dispatch(&self, node: &str, task: RemoteTask) -> ClusterResult<TaskHandle>;

    /// Ids of tasks currently running on `node`.
    fn running_tasks(&self, node: &str) -> BTreeSet<String>;
}

/// Wait for the first handle to finish.
///
/// Returns the finished task and the handles still pending, or `None` when
/// `handles` is empty.
pub async fn wait_any(handles: Vec<TaskHandle>) -> Option<(Completed, Vec<TaskHandle>)> {
    if handles.is_empty() {
        return None;
    }
    let (completed, _, rest) = select_all(handles).await;
    Some((completed, rest))
}

/// Remove and return every handle that has already finished.
pub fn poll_ready(handles: &mut Vec<TaskHandle>) -> Vec<Completed> {
    let mut finished = Vec::new();
    handles.retain_mut(|handle| match handle.try_complete() {
        Some(completed) => {
            finished.push(completed);
            false
        }
        None => true,
    });
    finished
}
