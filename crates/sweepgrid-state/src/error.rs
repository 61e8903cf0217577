//! Error types for the SweepGrid state store.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::TrialState;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("experiment directory {} already exists; set resume to continue it", .0.display())]
    DirectoryConflict(PathBuf),

    #[error("illegal transition for trial {trial_id}: {from} -> {to}")]
    IllegalTransition {
        trial_id: String,
        from: TrialState,
        to: TrialState,
    },

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),
}
