//! sweepgrid-state — durable experiment state for SweepGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Every trial record is
//! JSON-serialized into a `&[u8]` value column keyed by trial id; a second
//! table maps config digests to trial ids so sampling can reject duplicates
//! inside the same write transaction that reserves the new ids.
//!
//! # Architecture
//!
//! ```text
//! ExperimentState (directory semantics, sampler, budgets)
//!   └── TrialStore (redb)
//!       ├── trials        {trial_id}      → Trial
//!       ├── config_index  {config_digest} → trial_id
//!       └── meta          "experiment"    → ExperimentMeta
//! ```
//!
//! redb serializes write transactions, so `sample_trials` is a single-writer
//! critical section: concurrent callers never share a config or an id.

pub mod error;
pub mod experiment;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use experiment::{ExperimentOptions, ExperimentState};
pub use store::TrialStore;
pub use types::*;
