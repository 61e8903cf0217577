//! Trial execution wrapper.
//!
//! Runs a [`TrialBody`] inside its working directory and maps the result
//! onto a [`TrialOutcome`] according to a [`FaultPolicy`]:
//!
//! | body result                          | outcome                     |
//! |--------------------------------------|-----------------------------|
//! | report                               | `Complete`                  |
//! | report flagged or rejected by pruner | `PrunedPoorPerformance`     |
//! | error, not fault tolerant            | `Err(Unrecoverable)`        |
//! | error, no allow list                 | `Fail`                      |
//! | error kind in allow list             | `FailRecoverable`           |
//! | error kind not in allow list         | `Err(Unrecoverable)`        |

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sweep_core::TrialConfig;
use sweep_core::config::{FaultToleranceConfig, PruningConfig};
use sweepgrid_state::{TrialId, TrialMetrics, TrialState, metrics_serde};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Checkpoints live in this subdirectory of a trial's working directory.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// What a trial body sees while it runs.
#[derive(Debug, Clone)]
pub struct TrialContext {
    pub trial_id: TrialId,
    pub config: TrialConfig,
    /// Continue from the latest checkpoint instead of starting over.
    pub resume: bool,
    pub trial_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// 1 for the first run, incremented on every retry.
    pub attempt: u32,
    /// GPU key (`name:index`) reserved for this trial.
    pub gpu: Option<String>,
    pruning: Option<PruningConfig>,
}

impl TrialContext {
    pub fn new(trial_id: impl Into<TrialId>, config: TrialConfig, trial_dir: impl Into<PathBuf>) -> Self {
        let trial_dir = trial_dir.into();
        Self {
            trial_id: trial_id.into(),
            config,
            resume: false,
            checkpoint_dir: trial_dir.join(CHECKPOINT_DIR),
            trial_dir,
            attempt: 1,
            gpu: None,
            pruning: None,
        }
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_gpu(mut self, gpu: Option<String>) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_pruning(mut self, pruning: Option<PruningConfig>) -> Self {
        self.pruning = pruning;
        self
    }

    pub fn pruning(&self) -> Option<&PruningConfig> {
        self.pruning.as_ref()
    }

    /// Whether the configured pruner rejects these metrics. Bodies may call
    /// this on intermediate metrics to stop early.
    pub fn should_prune(&self, metrics: &TrialMetrics) -> bool {
        self.pruning.as_ref().is_some_and(|pruner| {
            metrics
                .get(&pruner.metric)
                .is_some_and(|value| pruner.should_prune(*value))
        })
    }
}

/// What a body returns on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialReport {
    pub metrics: TrialMetrics,
    /// The body stopped itself for poor performance.
    pub pruned: bool,
    /// Peak GPU memory the trial used (MB), for footprint estimation.
    pub gpu_peak_mb: Option<u64>,
}

impl TrialReport {
    pub fn new(metrics: TrialMetrics) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }

    pub fn pruned(metrics: TrialMetrics) -> Self {
        Self {
            metrics,
            pruned: true,
            gpu_peak_mb: None,
        }
    }

    pub fn with_gpu_peak(mut self, mb: u64) -> Self {
        self.gpu_peak_mb = Some(mb);
        self
    }
}

/// A failed trial body. `kind` is matched against the crash allow list.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TrialError {
    pub kind: String,
    pub message: String,
}

impl TrialError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// The training code of one trial.
pub trait TrialBody: Send + Sync + 'static {
    fn run(&self, ctx: &TrialContext) -> Result<TrialReport, TrialError>;
}

impl<F> TrialBody for F
where
    F: Fn(&TrialContext) -> Result<TrialReport, TrialError> + Send + Sync + 'static,
{
    fn run(&self, ctx: &TrialContext) -> Result<TrialReport, TrialError> {
        self(ctx)
    }
}

/// Result of one trial run, as shipped back from the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub trial_id: TrialId,
    pub state: TrialState,
    #[serde(default, with = "metrics_serde")]
    pub metrics: Option<TrialMetrics>,
    #[serde(default)]
    pub gpu_peak_mb: Option<u64>,
}

impl TrialOutcome {
    fn new(trial_id: &str, state: TrialState, metrics: Option<TrialMetrics>) -> Self {
        Self {
            trial_id: trial_id.to_string(),
            state,
            metrics,
            gpu_peak_mb: None,
        }
    }
}

/// How body errors are treated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultPolicy {
    pub fault_tolerant: bool,
    pub crash_allow_list: Option<BTreeSet<String>>,
    pub clean_reset: bool,
}

impl From<&FaultToleranceConfig> for FaultPolicy {
    fn from(config: &FaultToleranceConfig) -> Self {
        Self {
            fault_tolerant: config.fault_tolerant,
            crash_allow_list: config
                .crash_allow_list
                .as_ref()
                .map(|kinds| kinds.iter().cloned().collect()),
            clean_reset: config.clean_reset,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrialRunError {
    #[error("could not find a valid checkpoint in {}", .0.display())]
    CheckpointMissing(PathBuf),

    #[error("trial {trial_id} failed: {source}{note}")]
    Unrecoverable {
        trial_id: TrialId,
        source: TrialError,
        note: String,
    },

    #[error("trial directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Run `body` under `policy`.
pub fn run_trial<B>(body: &B, ctx: &TrialContext, policy: &FaultPolicy) -> Result<TrialOutcome, TrialRunError>
where
    B: TrialBody + ?Sized,
{
    let trial_id = ctx.trial_id.as_str();

    if ctx.resume {
        if !has_checkpoint(&ctx.checkpoint_dir) {
            if policy.clean_reset {
                warn!(%trial_id, "no checkpoint to resume from; starting over");
                reset_dir(&ctx.trial_dir)?;
                return Ok(TrialOutcome::new(trial_id, TrialState::FailRecoverable, None));
            }
            return Err(TrialRunError::CheckpointMissing(ctx.checkpoint_dir.clone()));
        }
    } else if has_checkpoint(&ctx.checkpoint_dir) {
        info!(%trial_id, "resume is set to false; clearing previous trial state");
        reset_dir(&ctx.trial_dir)?;
    }
    std::fs::create_dir_all(&ctx.checkpoint_dir).map_err(|source| TrialRunError::Io {
        path: ctx.checkpoint_dir.clone(),
        source,
    })?;

    match body.run(ctx) {
        Ok(report) => {
            let pruned = report.pruned || ctx.should_prune(&report.metrics);
            let state = if pruned {
                TrialState::PrunedPoorPerformance
            } else {
                TrialState::Complete
            };
            let mut outcome = TrialOutcome::new(trial_id, state, Some(report.metrics));
            outcome.gpu_peak_mb = report.gpu_peak_mb;
            Ok(outcome)
        }
        Err(err) => handle_error(ctx, policy, err),
    }
}

fn handle_error(
    ctx: &TrialContext,
    policy: &FaultPolicy,
    err: TrialError,
) -> Result<TrialOutcome, TrialRunError> {
    let trial_id = ctx.trial_id.as_str();
    if !policy.fault_tolerant {
        return Err(TrialRunError::Unrecoverable {
            trial_id: trial_id.to_string(),
            source: err,
            note: String::new(),
        });
    }

    match &policy.crash_allow_list {
        None => {
            warn!(%trial_id, error = %err, "trial failed");
            Ok(TrialOutcome::new(trial_id, TrialState::Fail, None))
        }
        Some(allowed) if allowed.contains(&err.kind) => {
            warn!(%trial_id, error = %err, "trial failed with a recoverable error");
            if policy.clean_reset {
                reset_dir(&ctx.trial_dir)?;
            }
            Ok(TrialOutcome::new(trial_id, TrialState::FailRecoverable, None))
        }
        Some(allowed) => {
            let kinds: Vec<&str> = allowed.iter().map(String::as_str).collect();
            Err(TrialRunError::Unrecoverable {
                trial_id: trial_id.to_string(),
                note: format!(
                    " (error kind `{}` is not in crash_allow_list [{}])",
                    err.kind,
                    kinds.join(", ")
                ),
                source: err,
            })
        }
    }
}

/// Whether `dir` holds at least one checkpoint file.
pub fn has_checkpoint(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .any(|entry| entry.file_type().is_file())
}

fn reset_dir(dir: &Path) -> Result<(), TrialRunError> {
    let io = |source| TrialRunError::Io {
        path: dir.to_path_buf(),
        source,
    };
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io(e)),
    }
    std::fs::create_dir_all(dir).map_err(io)
}
