//! Content hashes used as identity for rules, groups and alerts.
//!
//! The composition of each hash is load-bearing: alert IDs computed from
//! persisted `ALERTS_FOR_STATE` series on restore must match the IDs computed
//! from live query results.

use xxhash_rust::xxh64::Xxh64;

use crate::types::{Label, Labels, METRIC_NAME_LABEL};

const SEPARATOR: &[u8] = b"\xff";

/// Rule kind tag mixed into the rule ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Produces stateful alerts.
    Alerting,
    /// Produces derived time series.
    Recording,
}

impl RuleKind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alerting => "alerting",
            Self::Recording => "recording",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hashes a label set, ignoring `__name__` and label order.
pub fn labels_hash<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> u64 {
    let mut pairs: Vec<(&str, &str)> = labels
        .into_iter()
        .filter(|(name, _)| *name != METRIC_NAME_LABEL)
        .collect();
    pairs.sort_unstable();

    let mut h = Xxh64::new(0);
    for (name, value) in pairs {
        h.update(name.as_bytes());
        h.update(value.as_bytes());
        h.update(SEPARATOR);
    }
    h.digest()
}

/// Hashes the labels of a query result row.
#[must_use]
pub fn row_hash(labels: &[Label]) -> u64 {
    labels_hash(labels.iter().map(|l| (l.name.as_str(), l.value.as_str())))
}

/// Hashes the full label set of a pushed series, `__name__` included.
#[must_use]
pub fn series_hash(labels: &[Label]) -> u64 {
    let mut h = Xxh64::new(0);
    for l in labels {
        h.update(l.name.as_bytes());
        h.update(l.value.as_bytes());
        h.update(SEPARATOR);
    }
    h.digest()
}

/// Hashes a label map.
#[must_use]
pub fn map_hash(labels: &Labels) -> u64 {
    labels_hash(labels.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

/// Computes the content ID of a rule.
#[must_use]
pub fn rule_id(expr: &str, kind: RuleKind, name: &str, labels: &Labels) -> u64 {
    let mut h = Xxh64::new(0);
    h.update(expr.as_bytes());
    h.update(kind.as_str().as_bytes());
    h.update(name.as_bytes());
    for (k, v) in labels {
        h.update(k.as_bytes());
        h.update(v.as_bytes());
        h.update(SEPARATOR);
    }
    h.digest()
}

/// Computes the identity of a group from the file it was loaded from and its name.
#[must_use]
pub fn group_id(file: &str, name: &str) -> u64 {
    let mut h = Xxh64::new(0);
    h.update(file.as_bytes());
    h.update(SEPARATOR);
    h.update(name.as_bytes());
    h.digest()
}

/// Hashes arbitrary bytes, used for configuration checksums.
#[must_use]
pub fn checksum(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}
