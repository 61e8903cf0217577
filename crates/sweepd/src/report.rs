//! Plain-text experiment summaries.

use std::collections::BTreeMap;
use std::fmt::Write;

use sweep_core::config::{Direction, OptimMetric};
use sweepgrid_state::{Trial, TrialState};

/// One line: `trials: 12 (complete 10, fail 2)`.
pub fn format_counts(counts: &BTreeMap<TrialState, usize>) -> String {
    let total: usize = counts.values().sum();
    let parts: Vec<String> = counts
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(state, n)| format!("{state} {n}"))
        .collect();
    if parts.is_empty() {
        format!("trials: {total}")
    } else {
        format!("trials: {total} ({})", parts.join(", "))
    }
}

/// One row per trial.
pub fn format_trials(trials: &[Trial]) -> String {
    let mut out = format!(
        "{:<16} {:<24} {:>8}  {:<20} {}\n",
        "TRIAL", "STATE", "ATTEMPTS", "NODE", "METRICS"
    );
    for trial in trials {
        let metrics = trial
            .metrics
            .as_ref()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| format!("{k}={v:.4}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<16} {:<24} {:>8}  {:<20} {}",
            trial.id,
            trial.state.as_str(),
            trial.attempts,
            trial.node_assigned.as_deref().unwrap_or("-"),
            metrics
        );
    }
    out.truncate(out.trim_end().len());
    out
}

/// The best completed trial by `metric`, ignoring non-finite values.
pub fn best_trial<'a>(trials: &'a [Trial], metric: &OptimMetric) -> Option<(&'a Trial, f64)> {
    let candidates = trials.iter().filter_map(|trial| {
        if trial.state != TrialState::Complete {
            return None;
        }
        let value = *trial.metrics.as_ref()?.get(&metric.name)?;
        value.is_finite().then_some((trial, value))
    });
    match metric.direction {
        Direction::Min => candidates.min_by(|a, b| a.1.total_cmp(&b.1)),
        Direction::Max => candidates.max_by(|a, b| a.1.total_cmp(&b.1)),
    }
}

pub fn format_best(trials: &[Trial], metric: Option<&OptimMetric>) -> Option<String> {
    let metric = metric?;
    let (trial, value) = best_trial(trials, metric)?;
    let config = serde_json::to_string(&trial.config).unwrap_or_default();
    Some(format!(
        "best trial {}: {}={value} {config}",
        trial.id, metric.name
    ))
}
