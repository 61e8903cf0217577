//! NodeManager — node discovery and fan-out commands over a substrate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::resource::{PROBE_COMMAND, Resource};
use crate::substrate::{BoxFuture, NodeId, Substrate};

/// Source of per-node resource snapshots.
pub trait ResourceProbe: Send + Sync {
    fn available_resources(&self) -> BoxFuture<'_, ClusterResult<BTreeMap<NodeId, Resource>>>;
}

/// Discovers nodes and runs commands across them.
#[derive(Clone)]
pub struct NodeManager {
    substrate: Arc<dyn Substrate>,
    probe_command: String,
    probe_timeout: Duration,
}

impl NodeManager {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            probe_command: PROBE_COMMAND.to_string(),
            probe_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replace the shell snippet used by `available_resources`.
    pub fn with_probe_command(mut self, command: impl Into<String>) -> Self {
        self.probe_command = command.into();
        self
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Live nodes, re-queried on every call.
    pub fn discover_nodes(&self) -> ClusterResult<BTreeSet<NodeId>> {
        self.substrate.discover_nodes()
    }

    /// Run `command` on every live node in parallel.
    ///
    /// Nodes that fail or exceed `timeout` are left out of the result. With
    /// no live nodes the command runs on the head node alone.
    pub async fn run_cmd(
        &self,
        command: &str,
        timeout: Duration,
    ) -> ClusterResult<BTreeMap<NodeId, String>> {
        if !self.substrate.is_started() {
            return Err(ClusterError::Unavailable);
        }
        let mut nodes = self.substrate.discover_nodes()?;
        if nodes.is_empty() {
            nodes.insert(self.substrate.head_node());
        }

        let runs = nodes.into_iter().map(|node| {
            let call = self.substrate.run_remote(&node, command, timeout);
            async move {
                let result = match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("timed out after {timeout:?}")),
                };
                (node, result)
            }
        });

        let mut outputs = BTreeMap::new();
        for (node, result) in join_all(runs).await {
            match result {
                Ok(stdout) => {
                    outputs.insert(node, stdout);
                }
                Err(e) => debug!(%node, error = %e, "node excluded from command results"),
            }
        }
        Ok(outputs)
    }

    /// Probe every live node and parse its resources.
    ///
    /// Nodes whose probe fails or prints something unparseable are left out.
    pub async fn available_resources(&self) -> ClusterResult<BTreeMap<NodeId, Resource>> {
        let outputs = self.run_cmd(&self.probe_command, self.probe_timeout).await?;
        let mut resources = BTreeMap::new();
        for (node, output) in outputs {
            match Resource::parse_probe(&output) {
                Some(mut resource) => {
                    resource.running_task_ids = self.substrate.running_tasks(&node);
                    resources.insert(node, resource);
                }
                None => warn!(%node, "unparseable resource probe output"),
            }
        }
        Ok(resources)
    }
}

impl ResourceProbe for NodeManager {
    fn available_resources(&self) -> BoxFuture<'_, ClusterResult<BTreeMap<NodeId, Resource>>> {
        Box::pin(NodeManager::available_resources(self))
    }
}
