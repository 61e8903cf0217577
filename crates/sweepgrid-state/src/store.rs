//! TrialStore — redb-backed persistence for trial records.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). Every mutation is a single write transaction that is committed
//! before the method returns.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use sweep_core::{TrialConfig, config_digest};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe trial store backed by redb.
#[derive(Clone)]
pub struct TrialStore {
    db: Arc<Database>,
}

impl TrialStore {
    /// Open (or create) a persistent trial store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "trial store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory trial store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory trial store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(TRIALS).map_err(map_err!(Table))?;
        txn.open_table(CONFIG_INDEX).map_err(map_err!(Table))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            if meta.get(META_KEY).map_err(map_err!(Read))?.is_none() {
                let now = epoch_secs();
                let initial = ExperimentMeta {
                    created_at: now,
                    updated_at: now,
                    ..ExperimentMeta::default()
                };
                let value = serde_json::to_vec(&initial).map_err(map_err!(Serialize))?;
                meta.insert(META_KEY, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Meta ───────────────────────────────────────────────────────

    pub fn meta(&self) -> StateResult<ExperimentMeta> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        match table.get(META_KEY).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Ok(ExperimentMeta::default()),
        }
    }

    // ── Trials ─────────────────────────────────────────────────────

    /// Reserve up to `n` new trials in one write transaction.
    ///
    /// `limit` caps the total number of trials ever created. `draw` is
    /// called once per trial with the number of distinct configurations
    /// assigned so far and a predicate telling whether a config digest is
    /// already taken; returning `None` stops the reservation early.
    pub fn reserve_trials<F>(&self, n: usize, limit: Option<usize>, mut draw: F) -> StateResult<Vec<Trial>>
    where
        F: FnMut(u64, &mut dyn FnMut(&str) -> bool) -> Option<TrialConfig>,
    {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut created = Vec::new();
        {
            let mut meta_table = txn.open_table(META).map_err(map_err!(Table))?;
            let mut meta: ExperimentMeta = match meta_table.get(META_KEY).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => ExperimentMeta::default(),
            };
            let mut trials = txn.open_table(TRIALS).map_err(map_err!(Table))?;
            let mut index = txn.open_table(CONFIG_INDEX).map_err(map_err!(Table))?;

            let room = match limit {
                Some(limit) => limit.saturating_sub(meta.next_seq as usize).min(n),
                None => n,
            };

            for _ in 0..room {
                let drawn = {
                    // A failed lookup counts as taken so a config is never handed out twice.
                    let mut is_taken = |digest: &str| index.get(digest).map_or(true, |g| g.is_some());
                    draw(meta.distinct_configs, &mut is_taken)
                };
                let Some(config) = drawn else {
                    break;
                };

                let digest = config_digest(&config);
                let trial = Trial::new(meta.next_seq, config, digest, now);
                let value = serde_json::to_vec(&trial).map_err(map_err!(Serialize))?;
                trials
                    .insert(trial.table_key(), value.as_slice())
                    .map_err(map_err!(Write))?;

                let fresh = index
                    .get(trial.config_digest.as_str())
                    .map_err(map_err!(Read))?
                    .is_none();
                if fresh {
                    index
                        .insert(trial.config_digest.as_str(), trial.id.as_str())
                        .map_err(map_err!(Write))?;
                    meta.distinct_configs += 1;
                }

                meta.next_seq += 1;
                created.push(trial);
            }

            meta.updated_at = now;
            let value = serde_json::to_vec(&meta).map_err(map_err!(Serialize))?;
            meta_table
                .insert(META_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = created.len(), "trials reserved");
        Ok(created)
    }

    /// Get a trial by id.
    pub fn get_trial(&self, trial_id: &str) -> StateResult<Option<Trial>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
        match table.get(trial_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let trial: Trial =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(trial))
            }
            None => Ok(None),
        }
    }

    /// List all trials in creation order.
    pub fn list_trials(&self) -> StateResult<Vec<Trial>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let trial: Trial =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(trial);
        }
        results.sort_by_key(|t| t.seq);
        Ok(results)
    }

    /// Read-modify-write a trial in one transaction.
    ///
    /// If `update` fails the transaction is dropped and nothing changes.
    pub fn update_trial<F>(&self, trial_id: &str, update: F) -> StateResult<Trial>
    where
        F: FnOnce(&mut Trial) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let trial = {
            let mut table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
            let mut trial: Trial = match table.get(trial_id).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(format!("trial {trial_id}"))),
            };
            update(&mut trial)?;
            trial.updated_at = epoch_secs();
            let value = serde_json::to_vec(&trial).map_err(map_err!(Serialize))?;
            table
                .insert(trial_id, value.as_slice())
                .map_err(map_err!(Write))?;
            trial
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%trial_id, state = %trial.state, "trial updated");
        Ok(trial)
    }

    /// Move every `Running` trial to `FailRecoverable`.
    ///
    /// Run when an experiment is reopened: whatever was running belonged to
    /// a scheduler that is gone. Returns the number of trials moved.
    pub fn recover_stale(&self) -> StateResult<usize> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let recovered;
        {
            let mut table = txn.open_table(TRIALS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let trial: Trial =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if trial.state == TrialState::Running {
                    stale.push(trial);
                }
            }
            recovered = stale.len();
            for mut trial in stale {
                trial.state = TrialState::FailRecoverable;
                trial.updated_at = now;
                let value = serde_json::to_vec(&trial).map_err(map_err!(Serialize))?;
                table
                    .insert(trial.table_key(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(recovered)
    }
}

/// Current time as seconds since the Unix epoch.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
