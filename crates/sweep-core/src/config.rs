//! sweep.toml run configuration parser.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::search::{ParamValue, SamplerKind, SearchSpace, TrialConfig};

/// Top-level run configuration for one experiment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Parameters every trial must carry a value for.
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub fault_tolerance: FaultToleranceConfig,
    #[serde(default)]
    pub optim_metrics: Vec<OptimMetric>,
    pub pruning: Option<PruningConfig>,
    /// Fixed values merged into every sampled configuration.
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub search_space: SearchSpace,
    pub trial: Option<TrialCommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub dir: Option<PathBuf>,
    /// Upper bound on trials ever created; unbounded when unset.
    pub total_trials: Option<usize>,
    /// Upper bound on trials running at once; unbounded when unset.
    pub concurrent_trials: Option<usize>,
    #[serde(default)]
    pub sampler: SamplerKind,
    #[serde(default)]
    pub random_seed: u64,
    #[serde(default)]
    pub allow_duplicates: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            dir: None,
            total_trials: None,
            concurrent_trials: None,
            sampler: SamplerKind::default(),
            random_seed: 0,
            allow_duplicates: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default admission cap per `make_futures` call.
    #[serde(default = "default_soft_limit")]
    pub soft_limit: usize,
    /// Back-off while resources block every admission.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Dispatches allowed per trial, retries included.
    #[serde(default = "default_max_attempts")]
    pub max_trial_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_soft_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            max_trial_attempts: default_max_attempts(),
        }
    }
}

/// Compute device the trials run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub device: Device,
    /// Lower bound of the per-trial GPU memory estimate (MB).
    #[serde(default)]
    pub gpu_mb_per_trial: u64,
    /// A node at or above this CPU usage receives no new trials.
    #[serde(default = "default_saturation")]
    pub cpu_saturation_pct: f64,
    /// A node at or above this memory usage receives no new trials.
    #[serde(default = "default_saturation")]
    pub mem_saturation_pct: f64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            gpu_mb_per_trial: 0,
            cpu_saturation_pct: default_saturation(),
            mem_saturation_pct: default_saturation(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultToleranceConfig {
    #[serde(default = "default_true")]
    pub fault_tolerant: bool,
    /// Error kinds treated as recoverable. When unset, every error is a
    /// terminal failure under fault tolerance.
    pub crash_allow_list: Option<Vec<String>>,
    /// Wipe a trial's directory after a recoverable failure instead of
    /// resuming from its checkpoint.
    #[serde(default)]
    pub clean_reset: bool,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            fault_tolerant: true,
            crash_allow_list: None,
            clean_reset: false,
        }
    }
}

/// Whether lower or higher values of a metric are better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimMetric {
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
}

/// Threshold pruner: a trial whose metric is non-finite or on the wrong
/// side of `threshold` is pruned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningConfig {
    pub metric: String,
    pub threshold: f64,
    #[serde(default)]
    pub direction: Direction,
}

impl PruningConfig {
    /// Whether `value` is poor enough to stop the trial.
    pub fn should_prune(&self, value: f64) -> bool {
        if !value.is_finite() {
            return true;
        }
        match self.direction {
            Direction::Min => value > self.threshold,
            Direction::Max => value < self.threshold,
        }
    }
}

/// Shell command used by `sweepd` as the trial body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialCommandConfig {
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_name() -> String {
    "experiment".to_string()
}

fn default_soft_limit() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_saturation() -> f64 {
    90.0
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: RunConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Construction-time checks.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for metric in &self.optim_metrics {
            if !names.insert(metric.name.as_str()) {
                return Err(ConfigError::DuplicateMetricName(metric.name.clone()));
            }
        }

        for param in &self.required_params {
            if !self.params.contains_key(param) && !self.search_space.contains(param) {
                return Err(ConfigError::Ambiguous(param.clone()));
            }
        }

        if self.scheduler.soft_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.soft_limit",
                reason: "must admit at least one trial per cycle".to_string(),
            });
        }
        if self.experiment.concurrent_trials == Some(0) {
            return Err(ConfigError::Invalid {
                field: "experiment.concurrent_trials",
                reason: "must allow at least one running trial".to_string(),
            });
        }

        self.search_space.validate()?;

        if self.experiment.sampler == SamplerKind::Grid {
            if let Some((name, _)) = self
                .search_space
                .params()
                .iter()
                .find(|(_, space)| space.cardinality().is_none())
            {
                return Err(ConfigError::InvalidSearchSpace {
                    param: name.clone(),
                    reason: "grid sampling needs a discrete range (set `num`)".to_string(),
                });
            }
        }

        Ok(())
    }

    /// The fixed parameters as a base trial configuration.
    pub fn base_config(&self) -> TrialConfig {
        self.params.clone()
    }

    /// The experiment directory, made absolute.
    pub fn experiment_dir(&self) -> Option<PathBuf> {
        self.experiment.dir.as_deref().map(absolute_path)
    }
}

/// Make `path` absolute against the current directory, resolving `.` and
/// `..` lexically (the path need not exist).
pub fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParamSpace;

    const FULL: &str = r#"
required_params = ["lr"]

[experiment]
name = "lr-sweep"
total_trials = 20
concurrent_trials = 4
sampler = "grid"

[resources]
device = "cuda"
gpu_mb_per_trial = 100

[fault_tolerance]
crash_allow_list = ["oom"]

[[optim_metrics]]
name = "val_loss"
direction = "min"

[pruning]
metric = "val_loss"
threshold = 10.0

[params]
epochs = 2

[search_space.lr]
type = "float"
low = 0.0
high = 19.0
num = 10
"#;

    #[test]
    fn test_parse_full() {
        let config = RunConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.experiment.total_trials, Some(20));
        assert_eq!(config.experiment.sampler, SamplerKind::Grid);
        assert_eq!(config.resources.device, Device::Cuda);
        assert_eq!(config.resources.cpu_saturation_pct, 90.0);
        assert_eq!(config.scheduler.soft_limit, 10);
        assert!(config.fault_tolerance.fault_tolerant);
        assert_eq!(config.params["epochs"], ParamValue::Int(2));
        assert_eq!(config.search_space.cardinality(), Some(10));
    }

    #[test]
    fn test_parse_minimal() {
        let config = RunConfig::from_toml_str("").unwrap();
        assert_eq!(config.experiment.name, "experiment");
        assert!(config.experiment.total_trials.is_none());
        assert!(config.search_space.is_empty());
    }

    #[test]
    fn duplicate_metric_names_are_rejected() {
        let mut config = RunConfig::default();
        config.optim_metrics = vec![
            OptimMetric { name: "val_loss".into(), direction: Direction::Min },
            OptimMetric { name: "val_loss".into(), direction: Direction::Max },
        ];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateMetricName(ref n) if n == "val_loss"));
    }

    #[test]
    fn unresolvable_required_param_is_ambiguous() {
        let mut config = RunConfig::default();
        config.required_params = vec!["ambiguous_var".into()];
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "ambiguous configuration: must provide value for ambiguous_var"
        );

        config.params.insert("ambiguous_var".into(), ParamValue::Int(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn grid_sampler_requires_discrete_space() {
        let mut config = RunConfig::default();
        config.experiment.sampler = SamplerKind::Grid;
        config.search_space = SearchSpace::new().with_param(
            "dropout",
            ParamSpace::Float { low: 0.0, high: 0.5, log: false, num: None },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSearchSpace { ref param, .. }) if param == "dropout"
        ));
    }

    #[test]
    fn pruning_threshold_and_divergence() {
        let pruning = PruningConfig {
            metric: "val_loss".into(),
            threshold: 10.0,
            direction: Direction::Min,
        };
        assert!(!pruning.should_prune(1.0));
        assert!(pruning.should_prune(11.0));
        assert!(pruning.should_prune(f64::INFINITY));
        assert!(pruning.should_prune(f64::NAN));
    }

    #[test]
    fn relative_dirs_are_normalized() {
        let cwd = std::env::current_dir().unwrap();
        let resolved = absolute_path(Path::new("../dir/../dir2/."));
        assert_eq!(resolved, cwd.parent().unwrap().join("dir2"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = RunConfig::from_toml_str(FULL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = RunConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.search_space, config.search_space);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = RunConfig::default();
        config.scheduler.soft_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "scheduler.soft_limit", .. })
        ));

        let mut config = RunConfig::default();
        config.experiment.concurrent_trials = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "experiment.concurrent_trials", .. })
        ));
    }
}
