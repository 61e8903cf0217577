//! sweep-core — shared configuration and search-space types for SweepGrid.
//!
//! - [`config`]: the `sweep.toml` run configuration and its validation
//! - [`search`]: parameter spaces, trial configurations, and samplers

pub mod config;
pub mod error;
pub mod search;

pub use config::RunConfig;
pub use error::{ConfigError, ConfigResult};
pub use search::{ParamSpace, ParamValue, Sampler, SamplerKind, SearchSpace, TrialConfig, config_digest};
