//! Scheduler error types.

use thiserror::Error;

use crate::wrapper::TrialRunError;

/// Errors that can occur while running an experiment.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("experiment state is not initialized; call init_state or launch first")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Config(#[from] sweep_core::ConfigError),

    #[error("state store error: {0}")]
    State(#[from] sweepgrid_state::StateError),

    #[error("cluster error: {0}")]
    Cluster(#[from] sweepgrid_cluster::ClusterError),

    #[error(transparent)]
    Trial(#[from] TrialRunError),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
