//! Bounded evaluation history kept per rule for health reporting.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Default number of entries kept per rule.
pub const DEFAULT_STATE_ENTRIES: usize = 20;

/// Outcome of one rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEntry {
    /// Evaluation timestamp.
    pub at: DateTime<Utc>,
    /// Time spent evaluating.
    pub duration: Duration,
    /// Number of series or alerts produced.
    pub samples: usize,
    /// Number of rows returned by the datasource.
    pub series_fetched: usize,
    /// Error message if the evaluation failed.
    pub error: Option<String>,
}

impl StateEntry {
    /// Returns true if the evaluation succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Ring buffer of the latest evaluation outcomes.
#[derive(Debug)]
pub struct RuleState {
    entries: RwLock<VecDeque<StateEntry>>,
    capacity: usize,
}

impl RuleState {
    /// Creates a buffer holding at most `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records an outcome, evicting the oldest one when full.
    pub fn add(&self, entry: StateEntry) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Returns the latest outcome.
    #[must_use]
    pub fn last(&self) -> Option<StateEntry> {
        self.entries.read().back().cloned()
    }

    /// Returns all outcomes, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<StateEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Returns the number of stored outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the max number of stored outcomes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RuleState {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_ENTRIES)
    }
}
