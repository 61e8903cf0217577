//! sweepgrid-scheduler — runs a hyperparameter sweep across a cluster.
//!
//! The [`ParallelTrainer`] is a caller-driven loop:
//!
//! ```text
//! heartbeat()        probe every node, refresh the resource snapshot
//! make_futures(k)    admit up to k trials onto eligible nodes, round-robin
//! reconcile(mode)    collect finished trials, persist their outcome
//! ```
//!
//! `launch` drives that loop until the experiment runs out of work. Each
//! dispatched trial runs inside [`wrapper::run_trial`], which applies the
//! fault-tolerance policy and turns the body's result into a
//! [`TrialOutcome`].

pub mod admission;
pub mod error;
pub mod journal;
pub mod load_balancer;
pub mod trainer;
pub mod wrapper;

pub use error::{SchedulerError, SchedulerResult};
pub use trainer::{ParallelTrainer, WaitMode};
pub use wrapper::{
    FaultPolicy, TrialBody, TrialContext, TrialError, TrialOutcome, TrialReport, TrialRunError,
};
