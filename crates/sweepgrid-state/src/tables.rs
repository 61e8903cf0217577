//! redb table definitions for the trial store.
//!
//! Trial records use `&str` keys and `&[u8]` values (JSON-serialized).

use redb::TableDefinition;

/// Trial records keyed by `{trial_id}`.
pub const TRIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("trials");

/// Config digest → trial id, for duplicate rejection while sampling.
pub const CONFIG_INDEX: TableDefinition<&str, &str> = TableDefinition::new("config_index");

/// Experiment counters keyed by [`META_KEY`].
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const META_KEY: &str = "experiment";
