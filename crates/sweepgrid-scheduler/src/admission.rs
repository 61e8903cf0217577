//! Admission control — which nodes may take another trial this cycle.
//!
//! A node is eligible while:
//! - its CPU and memory usage are below the saturation thresholds
//! - for GPU work, one of its GPUs has more free memory than a trial needs
//!
//! Each admission deducts the per-trial footprint from the chosen GPU. The
//! eligible list stays fixed for the cycle so round-robin positions keep
//! their meaning; a node that can no longer fit a trial is stepped over.

use std::collections::BTreeMap;

use sweep_core::config::{Device, ResourcesConfig};
use sweepgrid_cluster::{NodeId, Resource};

use crate::load_balancer::RoundRobinBalancer;

/// Thresholds applied to a resource snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionPolicy {
    pub cpu_saturation_pct: f64,
    pub mem_saturation_pct: f64,
    /// GPU memory reserved per trial (MB); 0 skips GPU checks.
    pub gpu_footprint_mb: u64,
}

impl AdmissionPolicy {
    pub fn new(resources: &ResourcesConfig, gpu_footprint_mb: u64) -> Self {
        Self {
            cpu_saturation_pct: resources.cpu_saturation_pct,
            mem_saturation_pct: resources.mem_saturation_pct,
            gpu_footprint_mb: match resources.device {
                Device::Cpu => 0,
                Device::Cuda => gpu_footprint_mb,
            },
        }
    }

    pub fn is_saturated(&self, resource: &Resource) -> bool {
        resource.cpu_usage_percent >= self.cpu_saturation_pct
            || resource.mem_usage_percent >= self.mem_saturation_pct
    }
}

/// One admission target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub node: NodeId,
    /// GPU key (`name:index`) the trial should use, for GPU work.
    pub gpu: Option<String>,
}

/// Remaining capacity for one `make_futures` cycle.
#[derive(Debug, Clone)]
pub struct AdmissionPlan {
    footprint_mb: u64,
    /// Nodes eligible at the start of the cycle, sorted.
    nodes: Vec<NodeId>,
    gpu_free: BTreeMap<NodeId, BTreeMap<String, u64>>,
}

impl AdmissionPlan {
    pub fn new(snapshot: &BTreeMap<NodeId, Resource>, policy: &AdmissionPolicy) -> Self {
        let footprint_mb = policy.gpu_footprint_mb;
        let mut plan = Self {
            footprint_mb,
            nodes: Vec::new(),
            gpu_free: BTreeMap::new(),
        };
        for (node, resource) in snapshot {
            if policy.is_saturated(resource) {
                continue;
            }
            if footprint_mb > 0 {
                plan.gpu_free.insert(node.clone(), resource.gpu_free_mb.clone());
                if !plan.fits(node) {
                    continue;
                }
            }
            plan.nodes.push(node.clone());
        }
        plan
    }

    pub fn eligible(&self) -> &[NodeId] {
        &self.nodes
    }

    /// No node can take another trial.
    pub fn is_empty(&self) -> bool {
        !self.nodes.iter().any(|node| self.fits(node))
    }

    fn fits(&self, node: &str) -> bool {
        self.footprint_mb == 0
            || self
                .gpu_free
                .get(node)
                .is_some_and(|gpus| gpus.values().any(|free| *free > self.footprint_mb))
    }

    /// Claim capacity on the next round-robin node. When the node at the
    /// balancer's position is full, the next node in sorted order that still
    /// fits is used instead.
    pub fn next_target(&mut self, balancer: &RoundRobinBalancer) -> Option<Target> {
        let len = self.nodes.len();
        let start = balancer.next(len)?;
        let node = (0..len)
            .map(|offset| &self.nodes[(start + offset) % len])
            .find(|node| self.fits(node))?
            .clone();
        if self.footprint_mb == 0 {
            return Some(Target { node, gpu: None });
        }

        let footprint = self.footprint_mb;
        let gpus = self.gpu_free.get_mut(&node)?;
        let (gpu, free) = gpus
            .iter_mut()
            .filter(|(_, free)| **free > footprint)
            .max_by_key(|(_, free)| **free)?;
        *free -= footprint;
        Some(Target {
            node,
            gpu: Some(gpu.clone()),
        })
    }
}
