//! LocalSubstrate — runs everything on this host.
//!
//! Nodes are logical: any number can be joined, and all of them execute on
//! the local machine. Commands go through `sh -c`; tasks run on tokio's
//! blocking pool so a trial body can do synchronous work.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};
use crate::substrate::{BoxFuture, NodeId, RemoteTask, Substrate, TaskHandle};

#[derive(Default)]
struct Inner {
    started: bool,
    nodes: BTreeSet<NodeId>,
    running: BTreeMap<NodeId, BTreeSet<String>>,
}

/// In-process substrate backed by this host.
#[derive(Clone)]
pub struct LocalSubstrate {
    head: NodeId,
    inner: Arc<Mutex<Inner>>,
}

impl Default for LocalSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSubstrate {
    pub fn new() -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "sweep".to_string());
        Self {
            head: format!("{user}@127.0.0.1"),
            inner: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self) {
        self.lock().started = true;
        info!(head = %self.head, "local substrate started");
    }

    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.started = false;
        inner.nodes.clear();
        info!("local substrate shut down");
    }

    /// Make `node` live.
    pub fn join_node(&self, node: impl Into<NodeId>) {
        let node = node.into();
        debug!(%node, "node joined");
        self.lock().nodes.insert(node);
    }

    pub fn leave_node(&self, node: &str) -> bool {
        let left = self.lock().nodes.remove(node);
        if left {
            debug!(%node, "node left");
        }
        left
    }

    fn knows(&self, inner: &Inner, node: &str) -> bool {
        node == self.head || inner.nodes.contains(node)
    }
}

impl Substrate for LocalSubstrate {
    fn is_started(&self) -> bool {
        self.lock().started
    }

    fn head_node(&self) -> NodeId {
        self.head.clone()
    }

    fn discover_nodes(&self) -> ClusterResult<BTreeSet<NodeId>> {
        let inner = self.lock();
        if !inner.started {
            return Err(ClusterError::Unavailable);
        }
        Ok(inner.nodes.clone())
    }

    fn run_remote(
        &self,
        node: &str,
        command: &str,
        timeout: Duration,
    ) -> BoxFuture<'static, anyhow::Result<String>> {
        let known = {
            let inner = self.lock();
            inner.started && self.knows(&inner, node)
        };
        let node = node.to_string();
        let command = command.to_string();
        Box::pin(async move {
            if !known {
                bail!("node {node} is not live");
            }
            let output = tokio::time::timeout(
                timeout,
                Command::new("sh").arg("-c").arg(&command).kill_on_drop(true).output(),
            )
            .await
            .with_context(|| format!("command on {node} timed out after {timeout:?}"))?
            .with_context(|| format!("failed to spawn command on {node}"))?;

            if !output.status.success() {
                bail!(
                    "command on {node} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }

    fn dispatch(&self, node: &str, task: RemoteTask) -> ClusterResult<TaskHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ClusterError::Dispatch {
            node: node.to_string(),
            reason: e.to_string(),
        })?;
        {
            let mut inner = self.lock();
            if !inner.started {
                return Err(ClusterError::Unavailable);
            }
            if !self.knows(&inner, node) {
                return Err(ClusterError::UnknownNode(node.to_string()));
            }
            inner
                .running
                .entry(node.to_string())
                .or_default()
                .insert(task.task_id.clone());
        }

        let (handle, tx) = TaskHandle::channel(task.task_id.clone(), node);
        let inner = Arc::clone(&self.inner);
        let node = node.to_string();
        let RemoteTask { task_id, job } = task;
        debug!(%task_id, %node, "task dispatched");

        runtime.spawn_blocking(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(job))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("task {task_id} panicked")));
            {
                let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(tasks) = inner.running.get_mut(&node) {
                    tasks.remove(&task_id);
                }
            }
            // The receiver may have been dropped; nothing left to notify.
            let _ = tx.send(result);
        });
        Ok(handle)
    }

    fn running_tasks(&self, node: &str) -> BTreeSet<String> {
        self.lock().running.get(node).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn started() -> LocalSubstrate {
        let substrate = LocalSubstrate::new();
        substrate.start();
        substrate
    }

    #[test]
    fn discover_requires_start() {
        let substrate = LocalSubstrate::new();
        assert!(matches!(
            substrate.discover_nodes(),
            Err(ClusterError::Unavailable)
        ));
        substrate.start();
        assert!(substrate.discover_nodes().unwrap().is_empty());
    }

    #[test]
    fn join_and_leave() {
        let substrate = started();
        substrate.join_node("a@10.0.0.2");
        substrate.join_node("b@10.0.0.1");
        let nodes: Vec<_> = substrate.discover_nodes().unwrap().into_iter().collect();
        assert_eq!(nodes, ["a@10.0.0.2", "b@10.0.0.1"]);
        assert!(substrate.leave_node("a@10.0.0.2"));
        assert!(!substrate.leave_node("a@10.0.0.2"));
        assert_eq!(substrate.discover_nodes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_remote_captures_stdout() {
        let substrate = started();
        let head = substrate.head_node();
        let out = substrate
            .run_remote(&head, "echo hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn run_remote_failures() {
        let substrate = started();
        let head = substrate.head_node();
        assert!(
            substrate
                .run_remote(&head, "exit 4", Duration::from_secs(5))
                .await
                .is_err()
        );
        assert!(
            substrate
                .run_remote("ghost@10.0.0.9", "true", Duration::from_secs(5))
                .await
                .is_err()
        );
        let err = substrate
            .run_remote(&head, "sleep 5", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn dispatch_runs_job_and_clears_running() {
        let substrate = started();
        substrate.join_node("n1");
        let handle = substrate
            .dispatch("n1", RemoteTask::new("t1", || Ok(Value::from("done"))))
            .unwrap();
        let completed = handle.await;
        assert_eq!(completed.task_id, "t1");
        assert_eq!(completed.result.unwrap(), Value::from("done"));
        assert!(substrate.running_tasks("n1").is_empty());
    }

    #[tokio::test]
    async fn dispatch_tracks_running_tasks() {
        let substrate = started();
        substrate.join_node("n1");
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = substrate
            .dispatch(
                "n1",
                RemoteTask::new("t1", move || {
                    release_rx.recv().ok();
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        assert_eq!(substrate.running_tasks("n1"), BTreeSet::from(["t1".to_string()]));
        release_tx.send(()).unwrap();
        assert!(handle.await.result.is_ok());
    }

    #[tokio::test]
    async fn dispatch_reports_panics() {
        let substrate = started();
        let head = substrate.head_node();
        let handle = substrate
            .dispatch(&head, RemoteTask::new("boom", || panic!("kaboom")))
            .unwrap();
        let err = handle.await.result.unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_or_stopped() {
        let substrate = LocalSubstrate::new();
        let head = substrate.head_node();
        assert!(matches!(
            substrate.dispatch(&head, RemoteTask::new("t", || Ok(Value::Null))),
            Err(ClusterError::Unavailable)
        ));
        substrate.start();
        assert!(matches!(
            substrate.dispatch("ghost", RemoteTask::new("t", || Ok(Value::Null))),
            Err(ClusterError::UnknownNode(_))
        ));
    }
}
