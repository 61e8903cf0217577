//! Per-node resource snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Shell snippet printing one `key value` line per metric.
///
/// `gpu` lines carry `index,name,free_mb` as reported by `nvidia-smi`.
pub const PROBE_COMMAND: &str = r#"n=$(nproc 2>/dev/null || echo 1)
echo "cpu_count $n"
awk -v n="$n" '{u=$1/n*100; if (u>100) u=100; printf "cpu_usage %.2f\n", u}' /proc/loadavg
awk '/^MemTotal:/{t=$2} /^MemAvailable:/{a=$2} END{if (t>0) printf "mem_usage %.2f\n", (t-a)/t*100}' /proc/meminfo
if command -v nvidia-smi >/dev/null 2>&1; then
  nvidia-smi --query-gpu=index,name,memory.free --format=csv,noheader,nounits | sed 's/, /,/g; s/^/gpu /'
fi"#;

/// A node's capacity as last probed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cpu_count: u32,
    pub cpu_usage_percent: f64,
    pub mem_usage_percent: f64,
    /// Free memory per GPU in MB, keyed `name:index`.
    pub gpu_free_mb: BTreeMap<String, u64>,
    /// Task ids the substrate reports running on the node.
    pub running_task_ids: BTreeSet<String>,
}

impl Resource {
    /// Parse the output of [`PROBE_COMMAND`].
    ///
    /// Returns `None` unless both CPU and memory usage are present.
    pub fn parse_probe(output: &str) -> Option<Self> {
        let mut resource = Resource::default();
        let mut cpu = None;
        let mut mem = None;

        for line in output.lines() {
            let Some((key, value)) = line.trim().split_once(' ') else {
                continue;
            };
            let value = value.trim();
            match key {
                "cpu_count" => resource.cpu_count = value.parse().ok()?,
                "cpu_usage" => cpu = Some(value.parse::<f64>().ok()?),
                "mem_usage" => mem = Some(value.parse::<f64>().ok()?),
                "gpu" => {
                    let (index, rest) = value.split_once(',')?;
                    let (name, free) = rest.rsplit_once(',')?;
                    let free = free.trim().parse().ok()?;
                    resource
                        .gpu_free_mb
                        .insert(format!("{}:{}", name.trim(), index.trim()), free);
                }
                _ => {}
            }
        }

        resource.cpu_usage_percent = cpu?;
        resource.mem_usage_percent = mem?;
        Some(resource)
    }
}
