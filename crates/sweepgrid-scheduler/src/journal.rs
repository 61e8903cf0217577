//! Scheduler journal — one JSON object per line in `scheduler.log`.
//!
//! A write failure is logged and otherwise ignored: losing a journal line
//! must not stop an experiment.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sweepgrid_state::TrialState;
use tracing::warn;

use crate::error::{SchedulerError, SchedulerResult};

/// Journal file name inside the experiment directory.
pub const JOURNAL_FILE: &str = "scheduler.log";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent<'a> {
    Launched {
        dir: &'a Path,
        resume: bool,
    },
    Dispatched {
        trial_id: &'a str,
        node: &'a str,
        attempt: u32,
        resume: bool,
    },
    Finished {
        trial_id: &'a str,
        node: &'a str,
        state: TrialState,
    },
    Failed {
        trial_id: &'a str,
        node: &'a str,
        error: String,
    },
    Notice {
        message: String,
    },
}

#[derive(Serialize)]
struct Entry<'a> {
    ts: u64,
    #[serde(flatten)]
    event: &'a JournalEvent<'a>,
}

/// Append-only event log.
#[derive(Debug, Default)]
pub struct Journal {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl Journal {
    /// Open (or create) the journal in `dir`.
    pub fn open(dir: &Path) -> SchedulerResult<Self> {
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SchedulerError::Journal(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path: Some(path),
            file: Some(file),
        })
    }

    /// A journal that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&mut self, event: JournalEvent<'_>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let entry = Entry {
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            event: &event,
        };
        let written = serde_json::to_string(&entry)
            .map_err(|e| e.to_string())
            .and_then(|line| writeln!(file, "{line}").map_err(|e| e.to_string()));
        if let Err(error) = written {
            warn!(path = ?self.path, %error, "failed to write scheduler journal");
        }
    }
}
