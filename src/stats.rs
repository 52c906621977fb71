//! Per-stage statistics accumulator.
//!
//! Every stage counts what it did per record and folds those counts into a batch-level
//! [`StageStats`]. Counters whose name starts with [`MAX_PREFIX`] are high-water marks and
//! merge by maximum; all others merge by sum.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Counters with this prefix merge by `max` instead of `+`.
pub const MAX_PREFIX: &str = "max_";

/// Named counters for one stage invocation (or one record within it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageStats {
    counters: IndexMap<String, u64>,
}

impl StageStats {
    /// Stats with every listed counter present and zero, so reports keep a stable shape.
    pub fn with_counters(names: &[&str]) -> Self {
        Self {
            counters: names.iter().map(|n| (n.to_string(), 0)).collect(),
        }
    }

    /// Add one to `name`.
    pub fn incr(&mut self, name: &str) {
        self.add(name, 1);
    }

    /// Add `n` to `name`.
    pub fn add(&mut self, name: &str, n: u64) {
        *self.slot(name) += n;
    }

    /// Raise `name` to at least `n`.
    pub fn record_max(&mut self, name: &str, n: u64) {
        let slot = self.slot(name);
        *slot = (*slot).max(n);
    }

    /// Current value of `name` (zero if never touched).
    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &StageStats) {
        for (name, &n) in &other.counters {
            if name.starts_with(MAX_PREFIX) {
                self.record_max(name, n);
            } else {
                self.add(name, n);
            }
        }
    }

    /// Iterate counters in first-touched order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, &v)| (k.as_str(), v))
    }

    fn slot(&mut self, name: &str) -> &mut u64 {
        self.counters.entry(name.to_string()).or_insert(0)
    }
}

impl fmt::Display for StageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, n) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{name}={n}")?;
            first = false;
        }
        Ok(())
    }
}
