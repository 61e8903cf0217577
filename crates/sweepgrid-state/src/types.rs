//! Domain types persisted in the trial store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sweep_core::TrialConfig;

/// Unique trial identifier, `{seq:05}_{digest prefix}`.
pub type TrialId = String;

/// Node identifier as reported by the execution substrate (`user@ip`).
pub type NodeId = String;

/// Named scalar metrics reported by a finished trial.
pub type TrialMetrics = BTreeMap<String, f64>;

/// Lifecycle state of a trial.
///
/// ```text
/// Waiting ──▶ Running ──▶ Complete | Fail | PrunedPoorPerformance
///                │
///                └──▶ FailRecoverable ──▶ Running (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Waiting,
    Running,
    Complete,
    Fail,
    FailRecoverable,
    PrunedPoorPerformance,
}

impl TrialState {
    pub const ALL: [TrialState; 6] = [
        TrialState::Waiting,
        TrialState::Running,
        TrialState::Complete,
        TrialState::Fail,
        TrialState::FailRecoverable,
        TrialState::PrunedPoorPerformance,
    ];

    /// Whether the lifecycle graph permits `self → next`.
    pub fn can_transition_to(self, next: TrialState) -> bool {
        use TrialState::*;
        matches!(
            (self, next),
            (Waiting, Running)
                | (Running, Complete)
                | (Running, Fail)
                | (Running, FailRecoverable)
                | (Running, PrunedPoorPerformance)
                | (FailRecoverable, Running)
        )
    }

    /// No further transitions are possible.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TrialState::Complete | TrialState::Fail | TrialState::PrunedPoorPerformance
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialState::Waiting => "waiting",
            TrialState::Running => "running",
            TrialState::Complete => "complete",
            TrialState::Fail => "fail",
            TrialState::FailRecoverable => "fail_recoverable",
            TrialState::PrunedPoorPerformance => "pruned_poor_performance",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sampled configuration and its execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    /// Creation order within the experiment, starting at 0.
    pub seq: u64,
    pub config: TrialConfig,
    pub config_digest: String,
    pub state: TrialState,
    #[serde(default, with = "metrics_serde")]
    pub metrics: Option<TrialMetrics>,
    pub node_assigned: Option<NodeId>,
    /// Number of times the trial was moved to `Running`.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Trial {
    pub fn new(seq: u64, config: TrialConfig, config_digest: String, now: u64) -> Self {
        Self {
            id: trial_id(seq, &config_digest),
            seq,
            config,
            config_digest,
            state: TrialState::Waiting,
            metrics: None,
            node_assigned: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn table_key(&self) -> &str {
        &self.id
    }
}

/// Build the trial id for creation index `seq`.
pub fn trial_id(seq: u64, digest: &str) -> TrialId {
    let prefix = digest.get(..8).unwrap_or(digest);
    format!("{seq:05}_{prefix}")
}

/// Experiment-wide counters, updated in the same transaction as the trials
/// they describe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMeta {
    /// Number of trials ever created; also the next trial's `seq`.
    pub next_seq: u64,
    /// Number of distinct configurations assigned.
    pub distinct_configs: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Serde adapter for metric maps that may hold NaN or infinities.
///
/// JSON has no encoding for non-finite numbers, so they are written as the
/// strings `"NaN"`, `"inf"` and `"-inf"`.
pub mod metrics_serde {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::TrialMetrics;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Finite(f64),
        Special(String),
    }

    impl From<f64> for Encoded {
        fn from(value: f64) -> Self {
            if value.is_finite() {
                Encoded::Finite(value)
            } else {
                Encoded::Special(value.to_string())
            }
        }
    }

    pub fn serialize<S: Serializer>(
        metrics: &Option<TrialMetrics>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        metrics
            .as_ref()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.as_str(), Encoded::from(*v)))
                    .collect::<BTreeMap<_, _>>()
            })
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<TrialMetrics>, D::Error> {
        let raw = Option::<BTreeMap<String, Encoded>>::deserialize(deserializer)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut metrics = TrialMetrics::new();
        for (name, value) in raw {
            let value = match value {
                Encoded::Finite(v) => v,
                Encoded::Special(s) => s
                    .parse::<f64>()
                    .map_err(|_| D::Error::custom(format!("invalid metric value {s:?}")))?,
            };
            metrics.insert(name, value);
        }
        Ok(Some(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph() {
        use TrialState::*;
        assert!(Waiting.can_transition_to(Running));
        assert!(Running.can_transition_to(FailRecoverable));
        assert!(FailRecoverable.can_transition_to(Running));
        assert!(!Waiting.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Running));
        assert!(!Fail.can_transition_to(FailRecoverable));
        for state in TrialState::ALL {
            if state.is_final() {
                assert!(TrialState::ALL.iter().all(|next| !state.can_transition_to(*next)));
            }
        }
    }

    #[test]
    fn trial_ids_sort_by_creation() {
        let digest = "abcdef0123456789".repeat(4);
        assert_eq!(trial_id(7, &digest), "00007_abcdef01");
        assert!(trial_id(9, &digest) < trial_id(10, &digest));
    }

    #[test]
    fn non_finite_metrics_survive_json() {
        let mut trial = Trial::new(0, TrialConfig::new(), "d".repeat(64), 1);
        let mut metrics = TrialMetrics::new();
        metrics.insert("loss".into(), f64::NAN);
        metrics.insert("acc".into(), 0.5);
        metrics.insert("grad".into(), f64::NEG_INFINITY);
        trial.metrics = Some(metrics);

        let bytes = serde_json::to_vec(&trial).unwrap();
        let back: Trial = serde_json::from_slice(&bytes).unwrap();
        let m = back.metrics.unwrap();
        assert!(m["loss"].is_nan());
        assert_eq!(m["acc"], 0.5);
        assert_eq!(m["grad"], f64::NEG_INFINITY);
    }

    #[test]
    fn missing_metrics_deserialize_as_none() {
        let trial = Trial::new(1, TrialConfig::new(), "e".repeat(64), 1);
        let json = serde_json::to_string(&trial).unwrap();
        let back: Trial = serde_json::from_str(&json).unwrap();
        assert!(back.metrics.is_none());
        assert_eq!(back.state, TrialState::Waiting);
    }
}
