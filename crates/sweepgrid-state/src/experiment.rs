//! ExperimentState — the experiment directory and its trial store.
//!
//! Owns directory semantics (create, refuse to clobber, resume) and the
//! sampler that feeds `sample_trials`. All state lives in the store so a
//! resumed experiment picks up exactly where the last one stopped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sweep_core::config::absolute_path;
use sweep_core::{RunConfig, Sampler, SamplerKind, SearchSpace, TrialConfig};
use tracing::{info, warn};

use crate::error::{StateError, StateResult};
use crate::store::TrialStore;
use crate::types::*;

/// File name of the redb database inside the experiment directory.
pub const STORE_FILE: &str = "trials.redb";

/// Per-trial working directories live under this subdirectory.
pub const TRIALS_DIR: &str = "trials";

/// Everything `ExperimentState` needs to know about sampling.
#[derive(Debug, Clone, Default)]
pub struct ExperimentOptions {
    pub total_trials: Option<usize>,
    pub search_space: SearchSpace,
    pub base: TrialConfig,
    pub sampler: SamplerKind,
    pub seed: u64,
    pub allow_duplicates: bool,
}

impl From<&RunConfig> for ExperimentOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            total_trials: config.experiment.total_trials,
            search_space: config.search_space.clone(),
            base: config.base_config(),
            sampler: config.experiment.sampler,
            seed: config.experiment.random_seed,
            allow_duplicates: config.experiment.allow_duplicates,
        }
    }
}

/// Durable record of every trial in one experiment.
pub struct ExperimentState {
    dir: Option<PathBuf>,
    store: TrialStore,
    sampler: Mutex<Sampler>,
    total_trials: Mutex<Option<usize>>,
}

impl ExperimentState {
    /// Open the experiment at `dir`.
    ///
    /// A non-empty `dir` is only reopened when `resume` is set; trials left
    /// `Running` by a previous scheduler become `FailRecoverable`.
    pub fn create_or_load(dir: &Path, resume: bool, options: ExperimentOptions) -> StateResult<Self> {
        let dir = absolute_path(dir);
        let occupied = dir.is_dir()
            && std::fs::read_dir(&dir)
                .map_err(|e| StateError::Io(format!("{}: {e}", dir.display())))?
                .next()
                .is_some();
        if occupied && !resume {
            return Err(StateError::DirectoryConflict(dir));
        }

        std::fs::create_dir_all(dir.join(TRIALS_DIR))
            .map_err(|e| StateError::Io(format!("{}: {e}", dir.display())))?;
        let store = TrialStore::open(&dir.join(STORE_FILE))?;

        if resume {
            let recovered = store.recover_stale()?;
            if recovered > 0 {
                warn!(recovered, dir = %dir.display(), "stale running trials marked recoverable");
            }
        }

        let state = Self::with_store(Some(dir), store, options)?;
        info!(
            dir = %state.dir.as_deref().unwrap_or(Path::new("")).display(),
            resume,
            trials = state.trials_created()?,
            "experiment opened"
        );
        Ok(state)
    }

    /// Open an existing experiment for reading, without recovering stale
    /// trials or sampling anything.
    pub fn inspect(dir: &Path) -> StateResult<Self> {
        let dir = absolute_path(dir);
        let path = dir.join(STORE_FILE);
        if !path.is_file() {
            return Err(StateError::NotFound(format!("trial store {}", path.display())));
        }
        let store = TrialStore::open(&path)?;
        Self::with_store(Some(dir), store, ExperimentOptions::default())
    }

    /// An experiment with no directory, backed by an in-memory store.
    pub fn in_memory(options: ExperimentOptions) -> StateResult<Self> {
        Self::with_store(None, TrialStore::open_in_memory()?, options)
    }

    fn with_store(dir: Option<PathBuf>, store: TrialStore, options: ExperimentOptions) -> StateResult<Self> {
        // Offset the seed by the trials already drawn so a resumed random
        // sampler does not replay its first draws.
        let drawn = store.meta()?.next_seq;
        let sampler = Sampler::new(
            options.search_space,
            options.base,
            options.sampler,
            options.seed.wrapping_add(drawn),
        )
        .with_duplicates(options.allow_duplicates);

        Ok(Self {
            dir,
            store,
            sampler: Mutex::new(sampler),
            total_trials: Mutex::new(options.total_trials),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Working directory for one trial's checkpoints and scratch files.
    pub fn trial_dir(&self, trial_id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(TRIALS_DIR).join(trial_id))
    }

    pub fn total_trials(&self) -> Option<usize> {
        *self.total_trials.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the trial budget; only trials beyond those already created
    /// will be sampled.
    pub fn set_total_trials(&self, total: Option<usize>) {
        *self.total_trials.lock().unwrap_or_else(|e| e.into_inner()) = total;
    }

    /// Draw up to `n` new, never-assigned configurations as `Waiting` trials.
    ///
    /// Returns fewer than `n` (possibly none) when the trial budget or the
    /// search space runs out.
    pub fn sample_trials(&self, n: usize) -> StateResult<Vec<Trial>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = self.total_trials();
        let mut sampler = self.sampler.lock().unwrap_or_else(|e| e.into_inner());
        let trials = self
            .store
            .reserve_trials(n, limit, |taken, is_taken| sampler.draw(taken, is_taken))?;
        for trial in &trials {
            info!(trial_id = %trial.id, "trial sampled");
        }
        Ok(trials)
    }

    /// Apply a state transition, recording `metrics` when given.
    pub fn set_state(
        &self,
        trial_id: &str,
        state: TrialState,
        metrics: Option<TrialMetrics>,
    ) -> StateResult<Trial> {
        self.store.update_trial(trial_id, |trial| {
            check_transition(trial, state)?;
            trial.state = state;
            if metrics.is_some() {
                trial.metrics = metrics;
            }
            Ok(())
        })
    }

    /// Move a trial to `Running` on `node`, counting the attempt.
    pub fn start_trial(&self, trial_id: &str, node: &str) -> StateResult<Trial> {
        self.store.update_trial(trial_id, |trial| {
            check_transition(trial, TrialState::Running)?;
            trial.state = TrialState::Running;
            trial.node_assigned = Some(node.to_string());
            trial.attempts += 1;
            Ok(())
        })
    }

    pub fn get_trial(&self, trial_id: &str) -> StateResult<Trial> {
        self.store
            .get_trial(trial_id)?
            .ok_or_else(|| StateError::NotFound(format!("trial {trial_id}")))
    }

    /// Every trial in creation order.
    pub fn valid_trials(&self) -> StateResult<Vec<Trial>> {
        self.store.list_trials()
    }

    pub fn trials_by_state(&self, state: TrialState) -> StateResult<Vec<Trial>> {
        Ok(self
            .store
            .list_trials()?
            .into_iter()
            .filter(|t| t.state == state)
            .collect())
    }

    pub fn get_trial_configs_by_state(&self, state: TrialState) -> StateResult<Vec<TrialConfig>> {
        Ok(self
            .trials_by_state(state)?
            .into_iter()
            .map(|t| t.config)
            .collect())
    }

    /// Trials that were sampled but never dispatched.
    pub fn pending_trials(&self) -> StateResult<Vec<Trial>> {
        self.trials_by_state(TrialState::Waiting)
    }

    /// `FailRecoverable` trials with fewer than `max_attempts` attempts.
    pub fn retryable_trials(&self, max_attempts: u32) -> StateResult<Vec<Trial>> {
        Ok(self
            .trials_by_state(TrialState::FailRecoverable)?
            .into_iter()
            .filter(|t| t.attempts < max_attempts)
            .collect())
    }

    pub fn state_counts(&self) -> StateResult<BTreeMap<TrialState, usize>> {
        let mut counts = BTreeMap::new();
        for trial in self.store.list_trials()? {
            *counts.entry(trial.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Number of trials ever created in this experiment.
    pub fn trials_created(&self) -> StateResult<u64> {
        Ok(self.store.meta()?.next_seq)
    }
}

fn check_transition(trial: &Trial, next: TrialState) -> StateResult<()> {
    if trial.state.can_transition_to(next) {
        Ok(())
    } else {
        Err(StateError::IllegalTransition {
            trial_id: trial.id.clone(),
            from: trial.state,
            to: next,
        })
    }
}
