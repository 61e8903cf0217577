//! Search spaces, trial configurations, and samplers.
//!
//! A [`TrialConfig`] is an ordered map of parameter name to [`ParamValue`].
//! Two configurations are the same trial exactly when their
//! [`config_digest`] matches: the digest is a SHA-256 over a canonical
//! key-ordered binary encoding, so it is stable across processes and runs.

use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, ConfigResult};

/// Random draws attempted before falling back to an ordered scan.
const MAX_DRAW_ATTEMPTS: usize = 1_000;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

/// A fully-resolved trial configuration.
pub type TrialConfig = BTreeMap<String, ParamValue>;

/// Stable identity of a configuration, used for deduplication.
///
/// Every value is length- or type-prefixed and floats are hashed by their
/// bit pattern, so `NaN`, `inf` and `1` vs `1.0` all stay distinct.
pub fn config_digest(config: &TrialConfig) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in config {
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        match value {
            ParamValue::Bool(v) => {
                hasher.update([0u8, u8::from(*v)]);
            }
            ParamValue::Int(v) => {
                hasher.update([1u8]);
                hasher.update(v.to_le_bytes());
            }
            ParamValue::Float(v) => {
                hasher.update([2u8]);
                hasher.update(v.to_bits().to_le_bytes());
            }
            ParamValue::Str(v) => {
                hasher.update([3u8]);
                hasher.update((v.len() as u64).to_le_bytes());
                hasher.update(v.as_bytes());
            }
        }
    }
    hex::encode(hasher.finalize())
}

fn default_step() -> i64 {
    1
}

/// The space a single parameter is sampled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSpace {
    /// One of an explicit list of values.
    Choice { values: Vec<ParamValue> },
    /// Integers in `low..=high`, every `step`.
    Int {
        low: i64,
        high: i64,
        #[serde(default = "default_step")]
        step: i64,
    },
    /// Floats in `low..=high`. With `num` set, the range is discretized to
    /// `num` evenly spaced points (log-spaced when `log` is set).
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
        #[serde(default)]
        num: Option<u32>,
    },
}

impl ParamSpace {
    /// Number of distinct values, or `None` for a continuous range.
    pub fn cardinality(&self) -> Option<u64> {
        match self {
            ParamSpace::Choice { values } => Some(values.len() as u64),
            ParamSpace::Int { low, high, step } => {
                Some((high.abs_diff(*low) / step.unsigned_abs().max(1)).saturating_add(1))
            }
            ParamSpace::Float { num: Some(n), .. } => Some(u64::from(*n)),
            ParamSpace::Float { low, high, .. } if low == high => Some(1),
            ParamSpace::Float { .. } => None,
        }
    }

    /// The `index`-th value of a discrete space.
    fn value_at(&self, index: u64) -> ParamValue {
        match self {
            ParamSpace::Choice { values } => values[index as usize].clone(),
            // `low + index * step` never exceeds `high`; wrapping keeps the
            // arithmetic exact across the full i64 range.
            ParamSpace::Int { low, step, .. } => {
                ParamValue::Int(low.wrapping_add((index as i64).wrapping_mul(*step)))
            }
            ParamSpace::Float { low, high, log, num } => {
                let points = num.unwrap_or(1);
                if points <= 1 {
                    return ParamValue::Float(*low);
                }
                let frac = index as f64 / f64::from(points - 1);
                if *log {
                    let (lo, hi) = (low.ln(), high.ln());
                    ParamValue::Float((lo + (hi - lo) * frac).exp())
                } else {
                    ParamValue::Float(low + (high - low) * frac)
                }
            }
        }
    }

    fn sample(&self, rng: &mut StdRng) -> ParamValue {
        match self {
            ParamSpace::Float {
                low,
                high,
                log,
                num: None,
            } => {
                if low == high {
                    ParamValue::Float(*low)
                } else if *log {
                    ParamValue::Float(rng.gen_range(low.ln()..=high.ln()).exp())
                } else {
                    ParamValue::Float(rng.gen_range(*low..=*high))
                }
            }
            ParamSpace::Choice { values } => values
                .choose(rng)
                .cloned()
                .unwrap_or(ParamValue::Bool(false)),
            discrete => {
                let count = discrete.cardinality().unwrap_or(1);
                discrete.value_at(rng.gen_range(0..count))
            }
        }
    }

    /// Reject empty or inverted spaces.
    pub fn validate(&self, param: &str) -> ConfigResult<()> {
        let invalid = |reason: &str| ConfigError::InvalidSearchSpace {
            param: param.to_string(),
            reason: reason.to_string(),
        };
        match self {
            ParamSpace::Choice { values } if values.is_empty() => Err(invalid("no values to choose from")),
            ParamSpace::Int { step, .. } if *step <= 0 => Err(invalid("step must be positive")),
            ParamSpace::Int { low, high, .. } if low > high => Err(invalid("low is greater than high")),
            ParamSpace::Float { low, high, .. } if !(low <= high) => {
                Err(invalid("low is greater than high"))
            }
            ParamSpace::Float { low, log: true, .. } if *low <= 0.0 => {
                Err(invalid("log-scaled range must be strictly positive"))
            }
            ParamSpace::Float { num: Some(0), .. } => Err(invalid("num must be at least 1")),
            _ => Ok(()),
        }
    }
}

/// Named parameter spaces, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    params: BTreeMap<String, ParamSpace>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_param(mut self, name: &str, space: ParamSpace) -> Self {
        self.params.insert(name.to_string(), space);
        self
    }

    pub fn params(&self) -> &BTreeMap<String, ParamSpace> {
        &self.params
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of distinct configurations, or `None` when any parameter
    /// is continuous (or the product overflows).
    pub fn cardinality(&self) -> Option<u64> {
        self.params
            .values()
            .try_fold(1u64, |acc, space| acc.checked_mul(space.cardinality()?))
    }

    /// The `index`-th configuration in grid order. The last parameter (by
    /// name) varies fastest. Only meaningful for discrete spaces.
    pub fn config_at(&self, mut index: u64) -> TrialConfig {
        let mut config = TrialConfig::new();
        for (name, space) in self.params.iter().rev() {
            let count = space.cardinality().unwrap_or(1).max(1);
            config.insert(name.clone(), space.value_at(index % count));
            index /= count;
        }
        config
    }

    fn sample(&self, rng: &mut StdRng) -> TrialConfig {
        self.params
            .iter()
            .map(|(name, space)| (name.clone(), space.sample(rng)))
            .collect()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (name, space) in &self.params {
            space.validate(name)?;
        }
        Ok(())
    }
}

/// How new configurations are drawn from the search space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    Random,
    /// Enumerate the cartesian product in order.
    Grid,
}

/// Draws unique trial configurations from a [`SearchSpace`].
///
/// The sampler holds no record of what was handed out; callers pass an
/// `is_taken` predicate over config digests so the durable store stays the
/// single source of truth.
#[derive(Debug)]
pub struct Sampler {
    space: SearchSpace,
    base: TrialConfig,
    kind: SamplerKind,
    rng: StdRng,
    allow_duplicates: bool,
    grid_cursor: u64,
}

impl Sampler {
    pub fn new(space: SearchSpace, base: TrialConfig, kind: SamplerKind, seed: u64) -> Self {
        Self {
            space,
            base,
            kind,
            rng: StdRng::seed_from_u64(seed),
            allow_duplicates: false,
            grid_cursor: 0,
        }
    }

    /// Permit repeating configurations once the space is exhausted.
    pub fn with_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    pub fn cardinality(&self) -> Option<u64> {
        self.space.cardinality()
    }

    /// Draw one configuration whose digest `is_taken` does not reject.
    ///
    /// `taken` is the number of distinct configurations already assigned.
    /// Returns `None` once the space is exhausted (unless duplicates are
    /// allowed).
    pub fn draw(&mut self, taken: u64, mut is_taken: impl FnMut(&str) -> bool) -> Option<TrialConfig> {
        let cardinality = self.space.cardinality();
        if cardinality.is_some_and(|c| taken >= c) {
            if self.allow_duplicates {
                let sampled = self.space.sample(&mut self.rng);
                return Some(self.merge(sampled));
            }
            return None;
        }

        match (self.kind, cardinality) {
            (SamplerKind::Grid, Some(count)) => self.scan(count, &mut is_taken),
            (_, cardinality) => {
                for _ in 0..MAX_DRAW_ATTEMPTS {
                    let sampled = self.space.sample(&mut self.rng);
                    let config = self.merge(sampled);
                    if !is_taken(&config_digest(&config)) {
                        return Some(config);
                    }
                }
                // A nearly exhausted finite space: find the stragglers in order.
                let count = cardinality?;
                self.grid_cursor = 0;
                self.scan(count, &mut is_taken)
            }
        }
    }

    fn scan(&mut self, count: u64, is_taken: &mut impl FnMut(&str) -> bool) -> Option<TrialConfig> {
        while self.grid_cursor < count {
            let config = self.merge(self.space.config_at(self.grid_cursor));
            self.grid_cursor += 1;
            if !is_taken(&config_digest(&config)) {
                return Some(config);
            }
        }
        None
    }

    fn merge(&self, sampled: TrialConfig) -> TrialConfig {
        let mut config = self.base.clone();
        config.extend(sampled);
        config
    }
}
