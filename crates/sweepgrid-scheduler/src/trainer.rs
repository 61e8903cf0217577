//! ParallelTrainer — the resource-aware trial scheduler.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sweep_core::RunConfig;
use sweep_core::config::Device;
use sweepgrid_cluster::{
    Completed, NodeId, NodeManager, RemoteTask, Resource, ResourceProbe, Substrate, TaskHandle,
    poll_ready, wait_any,
};
use sweepgrid_state::{ExperimentOptions, ExperimentState, Trial, TrialState};
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionPlan, AdmissionPolicy, Target};
use crate::error::{SchedulerError, SchedulerResult};
use crate::journal::{Journal, JournalEvent};
use crate::load_balancer::RoundRobinBalancer;
use crate::wrapper::{FaultPolicy, TrialBody, TrialContext, TrialOutcome, has_checkpoint, run_trial};

/// How `reconcile` waits for in-flight trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Block until at least one trial finishes.
    Any,
    /// Collect only trials that have already finished.
    Poll,
}

/// Smoothing factor for the GPU footprint moving average.
const GPU_EMA_ALPHA: f64 = 0.3;

/// Per-trial GPU memory estimate.
#[derive(Debug, Clone, Default)]
struct GpuEstimator {
    floor_mb: u64,
    ema_mb: Option<f64>,
}

impl GpuEstimator {
    fn observe(&mut self, peak_mb: u64) {
        let peak = peak_mb as f64;
        self.ema_mb = Some(match self.ema_mb {
            Some(ema) => GPU_EMA_ALPHA * peak + (1.0 - GPU_EMA_ALPHA) * ema,
            None => peak,
        });
    }

    fn footprint_mb(&self) -> u64 {
        let ema = self.ema_mb.map_or(0, |ema| ema.round() as u64);
        self.floor_mb.max(ema)
    }
}

/// Runs trials of one experiment across the nodes of a substrate.
pub struct ParallelTrainer<B: TrialBody> {
    config: RunConfig,
    substrate: Arc<dyn Substrate>,
    probe: Arc<dyn ResourceProbe>,
    body: Arc<B>,
    policy: FaultPolicy,
    state: Option<ExperimentState>,
    journal: Journal,
    snapshot: Option<BTreeMap<NodeId, Resource>>,
    in_flight: Vec<TaskHandle>,
    balancer: RoundRobinBalancer,
    gpu: GpuEstimator,
    gpu_peaks: Vec<u64>,
    cpu_checked: bool,
    /// Set when the last `make_futures` found no trial to run.
    out_of_trials: bool,
}

impl<B: TrialBody> ParallelTrainer<B> {
    pub fn new(
        config: RunConfig,
        substrate: Arc<dyn Substrate>,
        probe: Arc<dyn ResourceProbe>,
        body: B,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let policy = FaultPolicy::from(&config.fault_tolerance);
        let gpu = GpuEstimator {
            floor_mb: config.resources.gpu_mb_per_trial,
            ema_mb: None,
        };
        Ok(Self {
            config,
            substrate,
            probe,
            body: Arc::new(body),
            policy,
            state: None,
            journal: Journal::disabled(),
            snapshot: None,
            in_flight: Vec::new(),
            balancer: RoundRobinBalancer::new(),
            gpu,
            gpu_peaks: Vec::new(),
            cpu_checked: false,
            out_of_trials: false,
        })
    }

    /// Build a trainer that probes nodes through a [`NodeManager`].
    pub fn with_node_manager(
        config: RunConfig,
        substrate: Arc<dyn Substrate>,
        body: B,
    ) -> SchedulerResult<Self> {
        let manager = NodeManager::new(Arc::clone(&substrate))
            .with_probe_timeout(Duration::from_secs(config.resources.probe_timeout_secs));
        Self::new(config, substrate, Arc::new(manager), body)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn experiment_state(&self) -> Option<&ExperimentState> {
        self.state.as_ref()
    }

    /// Number of dispatched trials not yet reconciled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// The resource snapshot from the last heartbeat.
    pub fn snapshot(&self) -> Option<&BTreeMap<NodeId, Resource>> {
        self.snapshot.as_ref()
    }

    /// Current per-trial GPU memory estimate (MB); 0 for CPU work.
    pub fn gpu_footprint_mb(&self) -> u64 {
        match self.config.resources.device {
            Device::Cpu => 0,
            Device::Cuda => self.gpu.footprint_mb(),
        }
    }

    pub fn set_total_trials(&mut self, total: Option<usize>) {
        self.config.experiment.total_trials = total;
        if let Some(state) = &self.state {
            state.set_total_trials(total);
        }
    }

    pub fn set_concurrent_trials(&mut self, concurrent: Option<usize>) {
        self.config.experiment.concurrent_trials = concurrent;
    }

    /// Open (or resume) the experiment store in `dir`.
    pub fn init_state(&mut self, dir: &Path, resume: bool) -> SchedulerResult<()> {
        let state = ExperimentState::create_or_load(dir, resume, ExperimentOptions::from(&self.config))?;
        let dir = state.dir().unwrap_or(dir);
        let mut journal = Journal::open(dir)?;
        journal.record(JournalEvent::Launched { dir, resume });
        self.journal = journal;
        self.state = Some(state);
        self.snapshot = None;
        self.out_of_trials = false;
        Ok(())
    }

    fn state(&self) -> SchedulerResult<&ExperimentState> {
        self.state.as_ref().ok_or(SchedulerError::NotInitialized)
    }

    /// Refresh the resource snapshot. Dispatches nothing.
    pub async fn heartbeat(&mut self) -> SchedulerResult<()> {
        let snapshot = self.probe.available_resources().await?;

        for peak in self.gpu_peaks.drain(..) {
            self.gpu.observe(peak);
        }

        if !self.cpu_checked {
            self.cpu_checked = true;
            let cpus: u64 = snapshot.values().map(|r| u64::from(r.cpu_count)).sum();
            if let Some(concurrent) = self.config.experiment.concurrent_trials {
                if cpus > 0 && concurrent as u64 > cpus {
                    let message = format!(
                        "concurrent_trials ({concurrent}) exceeds the {cpus} CPUs in the cluster; \
                         consider adjusting concurrent_trials"
                    );
                    warn!(concurrent, cpus, "{message}");
                    self.journal.record(JournalEvent::Notice { message });
                }
            }
        }

        debug!(
            nodes = snapshot.len(),
            gpu_footprint_mb = self.gpu_footprint_mb(),
            "heartbeat"
        );
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Admit up to `soft_limit` trials and return their target nodes in
    /// admission order.
    pub async fn make_futures(&mut self, soft_limit: usize) -> SchedulerResult<Vec<NodeId>> {
        self.state()?;
        if self.snapshot.is_none() {
            self.heartbeat().await?;
        }

        let concurrent_room = self
            .config
            .experiment
            .concurrent_trials
            .map_or(usize::MAX, |limit| limit.saturating_sub(self.in_flight.len()));
        let budget = soft_limit.min(concurrent_room);

        let policy = AdmissionPolicy::new(&self.config.resources, self.gpu_footprint_mb());
        let mut plan = match &self.snapshot {
            Some(snapshot) => AdmissionPlan::new(snapshot, &policy),
            None => return Ok(Vec::new()),
        };
        self.balancer.reset();
        self.out_of_trials = false;

        let mut admitted = Vec::new();
        if budget == 0 || plan.is_empty() {
            return Ok(admitted);
        }
        let mut queued = self.queued_trials()?;
        while admitted.len() < budget && !plan.is_empty() {
            let Some(trial) = self.next_trial(&mut queued)? else {
                self.out_of_trials = true;
                break;
            };
            let Some(target) = plan.next_target(&self.balancer) else {
                break;
            };
            let node = target.node.clone();
            if !self.dispatch(trial, target)? {
                break;
            }
            admitted.push(node);
        }

        if !admitted.is_empty() {
            debug!(
                admitted = admitted.len(),
                in_flight = self.in_flight.len(),
                "admission cycle"
            );
        }
        Ok(admitted)
    }

    /// Trials already in the store that should run before any fresh
    /// sample: never-dispatched trials first, then retries. Read once per
    /// cycle.
    fn queued_trials(&self) -> SchedulerResult<VecDeque<Trial>> {
        let state = self.state()?;
        let max_attempts = self.config.scheduler.max_trial_attempts;
        let mut queued: VecDeque<Trial> = state.pending_trials()?.into();
        queued.extend(state.retryable_trials(max_attempts)?);
        Ok(queued)
    }

    fn next_trial(&self, queued: &mut VecDeque<Trial>) -> SchedulerResult<Option<Trial>> {
        if let Some(trial) = queued.pop_front() {
            return Ok(Some(trial));
        }
        Ok(self.state()?.sample_trials(1)?.pop())
    }

    /// Mark `trial` running and ship it to its node. Returns `false` when
    /// the substrate refused the task.
    fn dispatch(&mut self, trial: Trial, target: Target) -> SchedulerResult<bool> {
        let state = self.state()?;
        let trial_dir = state
            .trial_dir(&trial.id)
            .ok_or(SchedulerError::NotInitialized)?;

        let started = state.start_trial(&trial.id, &target.node)?;
        let ctx = TrialContext::new(trial.id.clone(), trial.config, trial_dir)
            .with_attempt(started.attempts)
            .with_gpu(target.gpu)
            .with_pruning(self.config.pruning.clone());
        let resume = started.attempts > 1
            && !self.policy.clean_reset
            && has_checkpoint(&ctx.checkpoint_dir);
        let ctx = ctx.with_resume(resume);

        let body = Arc::clone(&self.body);
        let policy = self.policy.clone();
        let task = RemoteTask::new(trial.id.clone(), move || {
            let outcome = run_trial(body.as_ref(), &ctx, &policy)?;
            Ok(serde_json::to_value(outcome)?)
        });

        match self.substrate.dispatch(&target.node, task) {
            Ok(handle) => {
                info!(
                    trial_id = %trial.id,
                    node = %target.node,
                    attempt = started.attempts,
                    resume,
                    "trial dispatched"
                );
                self.journal.record(JournalEvent::Dispatched {
                    trial_id: &trial.id,
                    node: &target.node,
                    attempt: started.attempts,
                    resume,
                });
                self.in_flight.push(handle);
                Ok(true)
            }
            Err(e) => {
                warn!(trial_id = %trial.id, node = %target.node, error = %e, "dispatch failed");
                state.set_state(&trial.id, TrialState::FailRecoverable, None)?;
                self.journal.record(JournalEvent::Failed {
                    trial_id: &trial.id,
                    node: &target.node,
                    error: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Collect finished trials and persist their outcomes. Returns how many
    /// were collected.
    pub async fn reconcile(&mut self, mode: WaitMode) -> SchedulerResult<usize> {
        let mut finished = Vec::new();
        if mode == WaitMode::Any {
            let handles = std::mem::take(&mut self.in_flight);
            if let Some((first, rest)) = wait_any(handles).await {
                self.in_flight = rest;
                finished.push(first);
            }
        }
        finished.extend(poll_ready(&mut self.in_flight));

        // Every finished handle has left `in_flight`, so each result is
        // applied even when an earlier one fails to persist.
        let count = finished.len();
        let mut first_error = None;
        for completed in finished {
            let trial_id = completed.task_id.clone();
            if let Err(e) = self.apply(completed) {
                error!(%trial_id, error = %e, "failed to record trial result");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    fn apply(&mut self, completed: Completed) -> SchedulerResult<()> {
        let Completed {
            task_id: trial_id,
            node,
            result,
        } = completed;
        let state = self.state()?;

        let outcome = result.and_then(|value| Ok(serde_json::from_value::<TrialOutcome>(value)?));
        match outcome {
            Ok(outcome) => {
                state.set_state(&trial_id, outcome.state, outcome.metrics)?;
                info!(%trial_id, %node, state = %outcome.state, "trial finished");
                self.journal.record(JournalEvent::Finished {
                    trial_id: &trial_id,
                    node: &node,
                    state: outcome.state,
                });
                if let Some(peak) = outcome.gpu_peak_mb {
                    self.gpu_peaks.push(peak);
                }
            }
            Err(e) => {
                let error = format!("{e:#}");
                error!(%trial_id, %node, %error, "trial failed with an unrecoverable error");
                state.set_state(&trial_id, TrialState::Fail, None)?;
                self.journal.record(JournalEvent::Failed {
                    trial_id: &trial_id,
                    node: &node,
                    error,
                });
            }
        }
        Ok(())
    }

    /// Run the experiment in `dir` until no trial is left to run.
    ///
    /// Returns the final number of trials per state.
    pub async fn launch(
        &mut self,
        dir: &Path,
        resume: bool,
    ) -> SchedulerResult<BTreeMap<TrialState, usize>> {
        self.init_state(dir, resume)?;
        let soft_limit = self.config.scheduler.soft_limit;
        let poll_interval = Duration::from_millis(self.config.scheduler.poll_interval_ms);

        loop {
            self.heartbeat().await?;
            let admitted = self.make_futures(soft_limit).await?;

            if self.in_flight.is_empty() {
                if self.out_of_trials {
                    break;
                }
                if admitted.is_empty() {
                    debug!(?poll_interval, "no node can take a trial; waiting");
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            }
            self.reconcile(WaitMode::Any).await?;
        }

        let counts = self.state()?.state_counts()?;
        info!(?counts, "experiment finished");
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sweep_core::{ParamSpace, SearchSpace};
    use sweepgrid_cluster::{BoxFuture, ClusterResult, LocalSubstrate};
    use sweepgrid_state::{StateError, TrialMetrics};

    use crate::wrapper::{TrialError, TrialReport};

    /// Probe returning a fixed snapshot, counting calls.
    #[derive(Default)]
    struct FakeProbe {
        snapshot: Mutex<BTreeMap<NodeId, Resource>>,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn with_nodes(nodes: &[(&str, f64)]) -> Arc<Self> {
            let probe = Self::default();
            for (node, cpu) in nodes {
                probe.set(node, cpu_resource(*cpu));
            }
            Arc::new(probe)
        }

        fn set(&self, node: &str, resource: Resource) {
            self.snapshot.lock().unwrap().insert(node.to_string(), resource);
        }
    }

    impl ResourceProbe for FakeProbe {
        fn available_resources(&self) -> BoxFuture<'_, ClusterResult<BTreeMap<NodeId, Resource>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let snapshot = self.snapshot.lock().unwrap().clone();
            Box::pin(async move { Ok(snapshot) })
        }
    }

    fn cpu_resource(cpu: f64) -> Resource {
        Resource {
            cpu_count: 4,
            cpu_usage_percent: cpu,
            mem_usage_percent: 10.0,
            ..Resource::default()
        }
    }

    fn substrate(nodes: &[&str]) -> Arc<LocalSubstrate> {
        let substrate = LocalSubstrate::new();
        substrate.start();
        for node in nodes {
            substrate.join_node(*node);
        }
        Arc::new(substrate)
    }

    fn config(total: Option<usize>, points: u32) -> RunConfig {
        let mut config = RunConfig::default();
        config.experiment.total_trials = total;
        config.search_space = SearchSpace::new().with_param(
            "lr",
            ParamSpace::Float {
                low: 0.0,
                high: 19.0,
                log: false,
                num: Some(points),
            },
        );
        config.scheduler.poll_interval_ms = 10;
        config
    }

    fn loss_body(ctx: &TrialContext) -> Result<TrialReport, TrialError> {
        let lr = ctx.config["lr"].as_f64().unwrap_or_default();
        let mut metrics = TrialMetrics::new();
        metrics.insert("loss".into(), (lr - 3.0).abs());
        Ok(TrialReport::new(metrics))
    }

    fn trainer<B: TrialBody>(
        config: RunConfig,
        nodes: &[&str],
        probe: Arc<FakeProbe>,
        body: B,
    ) -> ParallelTrainer<B> {
        ParallelTrainer::new(config, substrate(nodes), probe, body).unwrap()
    }

    #[tokio::test]
    async fn make_futures_requires_state() {
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut t = trainer(config(None, 5), &["a"], probe, loss_body);
        assert!(matches!(
            t.make_futures(1).await,
            Err(SchedulerError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn heartbeat_dispatches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut t = trainer(config(None, 5), &["a"], probe.clone(), loss_body);
        t.init_state(tmp.path(), false).unwrap();
        t.heartbeat().await.unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(t.in_flight(), 0);
        assert_eq!(t.experiment_state().unwrap().trials_created().unwrap(), 0);
        assert_eq!(t.snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn admissions_round_robin_over_sorted_nodes() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("c", 1.0), ("a", 1.0), ("b", 1.0)]);
        let mut t = trainer(config(None, 20), &["a", "b", "c"], probe, loss_body);
        t.init_state(tmp.path(), false).unwrap();

        let nodes = t.make_futures(7).await.unwrap();
        assert_eq!(nodes, ["a", "b", "c", "a", "b", "c", "a"]);
        assert_eq!(t.in_flight(), 7);

        let state = t.experiment_state().unwrap();
        let running = state.trials_by_state(TrialState::Running).unwrap();
        assert_eq!(running.len(), 7);
        assert_eq!(running[0].node_assigned.as_deref(), Some("a"));
        assert_eq!(running[1].node_assigned.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn saturated_nodes_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0), ("b", 99.0), ("c", 1.0)]);
        let mut t = trainer(config(None, 20), &["a", "b", "c"], probe.clone(), loss_body);
        t.init_state(tmp.path(), false).unwrap();

        let nodes = t.make_futures(4).await.unwrap();
        assert_eq!(nodes, ["a", "c", "a", "c"]);

        // Every node saturated: nothing is admitted and nothing is sampled.
        probe.set("a", cpu_resource(95.0));
        probe.set("c", cpu_resource(95.0));
        t.heartbeat().await.unwrap();
        assert!(t.make_futures(4).await.unwrap().is_empty());
        assert_eq!(t.experiment_state().unwrap().trials_created().unwrap(), 4);
    }

    #[tokio::test]
    async fn concurrency_limit_frees_room_on_reconcile() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut cfg = config(None, 20);
        cfg.experiment.concurrent_trials = Some(2);
        let mut t = trainer(cfg, &["a"], probe, loss_body);
        t.init_state(tmp.path(), false).unwrap();

        assert_eq!(t.make_futures(10).await.unwrap().len(), 2);
        assert!(t.make_futures(10).await.unwrap().is_empty());

        let collected = t.reconcile(WaitMode::Any).await.unwrap();
        assert!(collected >= 1);
        assert_eq!(t.make_futures(10).await.unwrap().len(), collected);
        assert_eq!(t.in_flight(), 2);
    }

    #[tokio::test]
    async fn total_trials_bounds_admission() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut t = trainer(config(Some(3), 20), &["a"], probe, loss_body);
        t.init_state(tmp.path(), false).unwrap();
        assert_eq!(t.make_futures(10).await.unwrap().len(), 3);
        assert!(t.make_futures(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_poll_does_not_block() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let body = move |ctx: &TrialContext| -> Result<TrialReport, TrialError> {
            release_rx.lock().unwrap().recv().ok();
            loss_body(ctx)
        };
        let mut t = trainer(config(None, 5), &["a"], probe, body);
        t.init_state(tmp.path(), false).unwrap();
        t.make_futures(1).await.unwrap();

        assert_eq!(t.reconcile(WaitMode::Poll).await.unwrap(), 0);
        assert_eq!(t.in_flight(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(t.reconcile(WaitMode::Any).await.unwrap(), 1);
        let state = t.experiment_state().unwrap();
        assert_eq!(state.trials_by_state(TrialState::Complete).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_result_write_does_not_drop_other_results() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let body = move |ctx: &TrialContext| -> Result<TrialReport, TrialError> {
            release_rx.lock().unwrap().recv().ok();
            loss_body(ctx)
        };
        let nodes = substrate(&["a"]);
        let mut t = ParallelTrainer::new(config(None, 20), nodes.clone(), probe, body).unwrap();
        t.init_state(tmp.path(), false).unwrap();
        assert_eq!(t.make_futures(2).await.unwrap().len(), 2);

        // Finalize the first trial behind the scheduler's back so recording
        // its result is an illegal transition.
        let state = t.experiment_state().unwrap();
        let running = state.trials_by_state(TrialState::Running).unwrap();
        state
            .set_state(&running[0].id, TrialState::Complete, None)
            .unwrap();

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        while !nodes.running_tasks("a").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = t.reconcile(WaitMode::Poll).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::State(StateError::IllegalTransition { .. })
        ));
        assert_eq!(t.in_flight(), 0);

        let state = t.experiment_state().unwrap();
        let other = state.get_trial(&running[1].id).unwrap();
        assert_eq!(other.state, TrialState::Complete);
        assert!(other.metrics.unwrap().contains_key("loss"));
        assert!(state.trials_by_state(TrialState::Running).unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_cycle_runs_pending_then_retries_then_fresh_trials() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut t = trainer(config(None, 20), &["a"], probe, loss_body);
        t.init_state(tmp.path(), false).unwrap();

        let state = t.experiment_state().unwrap();
        let sampled = state.sample_trials(2).unwrap();
        let (retry, pending) = (&sampled[0], &sampled[1]);
        state.start_trial(&retry.id, "a").unwrap();
        state
            .set_state(&retry.id, TrialState::FailRecoverable, None)
            .unwrap();

        assert_eq!(t.make_futures(3).await.unwrap().len(), 3);

        let state = t.experiment_state().unwrap();
        assert_eq!(state.trials_created().unwrap(), 3);
        let running = state.trials_by_state(TrialState::Running).unwrap();
        assert_eq!(running.len(), 3);
        assert_eq!(state.get_trial(&pending.id).unwrap().attempts, 1);
        assert_eq!(state.get_trial(&retry.id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn gpu_footprint_limits_admissions_per_node() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[]);
        let mut gpu_node = cpu_resource(1.0);
        gpu_node.gpu_free_mb.insert("T4:0".into(), 10_000);
        probe.set("a", gpu_node);

        let mut cfg = config(None, 20);
        cfg.resources.device = Device::Cuda;
        cfg.resources.gpu_mb_per_trial = 4_000;
        let mut t = trainer(cfg, &["a"], probe, loss_body);
        t.init_state(tmp.path(), false).unwrap();

        assert_eq!(t.make_futures(10).await.unwrap(), ["a", "a"]);
    }

    #[test]
    fn gpu_estimate_tracks_reported_peaks() {
        let mut estimator = GpuEstimator {
            floor_mb: 1_000,
            ema_mb: None,
        };
        assert_eq!(estimator.footprint_mb(), 1_000);
        estimator.observe(5_000);
        assert_eq!(estimator.footprint_mb(), 5_000);
        estimator.observe(1_000);
        // 0.3 * 1000 + 0.7 * 5000
        assert_eq!(estimator.footprint_mb(), 3_800);
        estimator.observe(0);
        estimator.observe(0);
        estimator.observe(0);
        estimator.observe(0);
        estimator.observe(0);
        assert_eq!(estimator.footprint_mb(), 1_000);
    }

    #[tokio::test]
    async fn unrecoverable_errors_fail_the_trial_only() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut cfg = config(Some(4), 20);
        cfg.fault_tolerance.fault_tolerant = false;
        let body = |ctx: &TrialContext| -> Result<TrialReport, TrialError> {
            if ctx.config["lr"].as_f64() == Some(0.0) {
                return Err(TrialError::new("segfault", "bad"));
            }
            loss_body(ctx)
        };
        cfg.experiment.sampler = sweep_core::SamplerKind::Grid;
        let mut t = trainer(cfg, &["a"], probe, body);

        let counts = t.launch(tmp.path(), false).await.unwrap();
        assert_eq!(counts[&TrialState::Fail], 1);
        assert_eq!(counts[&TrialState::Complete], 3);
    }

    #[tokio::test]
    async fn recoverable_failures_retry_until_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut cfg = config(Some(1), 20);
        cfg.fault_tolerance.crash_allow_list = Some(vec!["oom".into()]);
        cfg.scheduler.max_trial_attempts = 3;
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        let body = move |_: &TrialContext| -> Result<TrialReport, TrialError> {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(TrialError::new("oom", "out of memory"))
        };
        let mut t = trainer(cfg, &["a"], probe, body);

        let counts = t.launch(tmp.path(), false).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(counts[&TrialState::FailRecoverable], 1);
        let trial = &t.experiment_state().unwrap().valid_trials().unwrap()[0];
        assert_eq!(trial.attempts, 3);
    }

    #[tokio::test]
    async fn retries_resume_from_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut cfg = config(Some(1), 20);
        cfg.fault_tolerance.crash_allow_list = Some(vec!["preempted".into()]);
        let body = |ctx: &TrialContext| -> Result<TrialReport, TrialError> {
            if ctx.resume {
                return loss_body(ctx);
            }
            std::fs::write(ctx.checkpoint_dir.join("epoch_1.ckpt"), b"state").unwrap();
            Err(TrialError::new("preempted", "node reclaimed"))
        };
        let mut t = trainer(cfg, &["a"], probe, body);

        let counts = t.launch(tmp.path(), false).await.unwrap();
        assert_eq!(counts[&TrialState::Complete], 1);
        let trial = &t.experiment_state().unwrap().valid_trials().unwrap()[0];
        assert_eq!(trial.attempts, 2);
    }

    #[tokio::test]
    async fn launch_on_existing_dir_without_resume_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut t = trainer(config(Some(2), 20), &["a"], probe.clone(), loss_body);
        t.launch(tmp.path(), false).await.unwrap();

        let mut again = trainer(config(Some(2), 20), &["a"], probe, loss_body);
        let err = again.launch(tmp.path(), false).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::State(StateError::DirectoryConflict(_))
        ));
        assert!(err.to_string().contains(&tmp.path().display().to_string()));
    }

    #[tokio::test]
    async fn journal_records_dispatch_and_finish() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut t = trainer(config(Some(2), 20), &["a"], probe, loss_body);
        t.launch(tmp.path(), false).await.unwrap();

        let log = std::fs::read_to_string(tmp.path().join(crate::journal::JOURNAL_FILE)).unwrap();
        assert_eq!(log.matches("\"event\":\"dispatched\"").count(), 2);
        assert_eq!(log.matches("\"event\":\"finished\"").count(), 2);
        assert!(log.lines().next().unwrap().contains("\"event\":\"launched\""));
    }

    #[tokio::test]
    async fn cpu_oversubscription_is_reported_once() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = FakeProbe::with_nodes(&[("a", 1.0)]);
        let mut cfg = config(Some(1), 20);
        cfg.experiment.concurrent_trials = Some(64);
        let mut t = trainer(cfg, &["a"], probe, loss_body);
        t.launch(tmp.path(), false).await.unwrap();

        let log = std::fs::read_to_string(tmp.path().join(crate::journal::JOURNAL_FILE)).unwrap();
        assert_eq!(log.matches("consider adjusting concurrent_trials").count(), 1);
    }
}
