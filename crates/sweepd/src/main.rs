//! sweepd — the SweepGrid command-line runner.
//!
//! # Usage
//!
//! ```text
//! sweepd launch --config sweep.toml --dir runs/lr-sweep
//! sweepd launch --config sweep.toml --dir runs/lr-sweep --resume
//! sweepd status --dir runs/lr-sweep
//! sweepd probe
//! ```

mod command_trial;
mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sweep_core::RunConfig;
use sweep_core::config::{Direction, OptimMetric};
use sweepgrid_cluster::{LocalSubstrate, NodeManager};
use sweepgrid_scheduler::ParallelTrainer;
use sweepgrid_state::ExperimentState;
use tracing::info;

use crate::command_trial::CommandTrial;

/// Log filter used when `RUST_LOG` is unset. Targets are crate names.
const DEFAULT_LOG_FILTER: &str =
    "info,sweepd=debug,sweepgrid_scheduler=debug,sweepgrid_state=debug,sweepgrid_cluster=debug";

#[derive(Parser)]
#[command(name = "sweepd", about = "SweepGrid hyperparameter sweep runner", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) an experiment until every trial has finished.
    Launch {
        /// Run configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Experiment directory; overrides `experiment.dir`.
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Continue the experiment already stored in the directory.
        #[arg(long)]
        resume: bool,

        /// Extra virtual worker nodes (`user@ip`) on this host.
        #[arg(long = "worker")]
        workers: Vec<String>,
    },
    /// Summarize the trials stored in an experiment directory.
    Status {
        #[arg(long)]
        dir: PathBuf,

        /// Metric used to pick the best trial.
        #[arg(long)]
        metric: Option<String>,

        /// Higher values of `--metric` are better.
        #[arg(long)]
        maximize: bool,
    },
    /// Print the resource snapshot of every node.
    Probe {
        /// Probe timeout in seconds.
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    match cli.command {
        Command::Launch {
            config,
            dir,
            resume,
            workers,
        } => launch(config, dir, resume, workers).await,
        Command::Status {
            dir,
            metric,
            maximize,
        } => status(dir, metric, maximize),
        Command::Probe { timeout } => probe(timeout).await,
    }
}

async fn launch(
    config_path: PathBuf,
    dir: Option<PathBuf>,
    resume: bool,
    workers: Vec<String>,
) -> anyhow::Result<()> {
    let config = RunConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let dir = dir
        .or_else(|| config.experiment_dir())
        .context("no experiment directory: pass --dir or set experiment.dir")?;
    let trial = config
        .trial
        .clone()
        .context("the run configuration has no [trial] command")?;
    let metric = config.optim_metrics.first().cloned();

    let substrate = Arc::new(LocalSubstrate::new());
    substrate.start();
    for worker in workers {
        substrate.join_node(worker);
    }

    info!(
        experiment = %config.experiment.name,
        dir = %dir.display(),
        resume,
        "launching experiment"
    );
    let mut trainer =
        ParallelTrainer::with_node_manager(config, substrate.clone(), CommandTrial::from(trial))?;
    let counts = trainer.launch(&dir, resume).await?;
    substrate.shutdown();

    println!("{}", report::format_counts(&counts));
    if let Some(state) = trainer.experiment_state() {
        let trials = state.valid_trials()?;
        if let Some(line) = report::format_best(&trials, metric.as_ref()) {
            println!("{line}");
        }
    }
    Ok(())
}

fn status(dir: PathBuf, metric: Option<String>, maximize: bool) -> anyhow::Result<()> {
    let state = ExperimentState::inspect(&dir)
        .with_context(|| format!("opening experiment in {}", dir.display()))?;
    let trials = state.valid_trials()?;

    println!("{}", report::format_trials(&trials));
    println!("{}", report::format_counts(&state.state_counts()?));
    let metric = metric.map(|name| OptimMetric {
        name,
        direction: if maximize { Direction::Max } else { Direction::Min },
    });
    if let Some(line) = report::format_best(&trials, metric.as_ref()) {
        println!("{line}");
    }
    Ok(())
}

async fn probe(timeout: u64) -> anyhow::Result<()> {
    let substrate = Arc::new(LocalSubstrate::new());
    substrate.start();
    let manager = NodeManager::new(substrate).with_probe_timeout(Duration::from_secs(timeout));
    let resources = manager.available_resources().await?;
    println!("{}", serde_json::to_string_pretty(&resources)?);
    Ok(())
}
