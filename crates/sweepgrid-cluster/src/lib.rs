//! sweepgrid-cluster — the compute substrate SweepGrid schedules onto.
//!
//! # Architecture
//!
//! ```text
//! NodeManager (implements ResourceProbe)
//!   ├── discover_nodes()       → live node ids, re-queried every call
//!   ├── run_cmd(cmd, timeout)  → per-node stdout, failures excluded
//!   └── available_resources()  → per-node Resource from the probe command
//!         │
//!         ▼
//! Arc<dyn Substrate>
//!   ├── LocalSubstrate (this host, `sh -c` + blocking task pool)
//!   └── test fakes
//! ```
//!
//! Dispatch returns a [`TaskHandle`] immediately; [`wait_any`] and
//! [`poll_ready`] collect finished handles.

pub mod error;
pub mod local;
pub mod manager;
pub mod resource;
pub mod substrate;

pub use error::{ClusterError, ClusterResult};
pub use local::LocalSubstrate;
pub use manager::{NodeManager, ResourceProbe};
pub use resource::{PROBE_COMMAND, Resource};
pub use substrate::{
    BoxFuture, Completed, NodeId, RemoteTask, Substrate, TaskHandle, poll_ready, wait_any,
};
