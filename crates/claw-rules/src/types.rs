//! Core types for the rule engine.
//!
//! This module provides the data exchanged between rules and their collaborators:
//! - [`Label`] and [`Labels`]: metric label pairs
//! - [`Metric`] and [`RangeMetric`]: query results from a [`crate::Querier`]
//! - [`TimeSeries`]: series pushed to a [`crate::RemoteWrite`] sink
//! - [`AlertState`]: the lifecycle state of an alert
//! - [`Alert`]: one instance of an alerting rule for one label set

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label holding the alerting rule name on alerts and synthetic series.
pub const ALERT_NAME_LABEL: &str = "alertname";

/// Label holding the alert state on the `ALERTS` series.
pub const ALERT_STATE_LABEL: &str = "alertstate";

/// Metric name of the synthetic alert state series.
pub const ALERT_METRIC_NAME: &str = "ALERTS";

/// Metric name of the synthetic series holding the alert activation time.
pub const ALERT_FOR_STATE_METRIC_NAME: &str = "ALERTS_FOR_STATE";

/// Prometheus staleness marker.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Returns the Prometheus staleness marker value.
#[must_use]
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Returns true if `v` is the Prometheus staleness marker.
#[must_use]
pub fn is_stale_nan(v: f64) -> bool {
    v.to_bits() == STALE_NAN_BITS
}

/// Sorted label set.
pub type Labels = BTreeMap<String, String>;

/// A single label pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Creates a new label.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Converts a label slice into a sorted map, last value wins on duplicates.
#[must_use]
pub fn labels_to_map(labels: &[Label]) -> Labels {
    labels
        .iter()
        .map(|l| (l.name.clone(), l.value.clone()))
        .collect()
}

/// Converts a label map into a label vector sorted by name.
#[must_use]
pub fn map_to_labels(labels: &Labels) -> Vec<Label> {
    labels
        .iter()
        .map(|(k, v)| Label::new(k.clone(), v.clone()))
        .collect()
}

/// Formats a label set as `{a="1", b="2"}`.
#[must_use]
pub fn format_labels(labels: &Labels) -> String {
    let inner: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{{{}}}", inner.join(", "))
}

/// Result row of an instant query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Labels of the row.
    pub labels: Vec<Label>,
    /// Sample value.
    pub value: f64,
    /// Sample timestamp in milliseconds.
    pub timestamp: i64,
}

impl Metric {
    /// Creates a metric from label pairs.
    #[must_use]
    pub fn new<K, V>(labels: impl IntoIterator<Item = (K, V)>, value: f64) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels
                .into_iter()
                .map(|(k, v)| Label::new(k, v))
                .collect(),
            value,
            timestamp: 0,
        }
    }

    /// Sets the sample timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the value of the label `name`.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }
}

/// A single sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Sample value.
    pub value: f64,
    /// Sample timestamp in milliseconds.
    pub timestamp: i64,
}

/// Result series of a range query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeMetric {
    /// Labels of the series.
    pub labels: Vec<Label>,
    /// Samples ordered by timestamp.
    pub samples: Vec<Sample>,
}

/// A series ready to be pushed to remote storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Labels including `__name__`, sorted by name.
    pub labels: Vec<Label>,
    /// Samples ordered by timestamp.
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    /// Creates a single-sample series named `name` with the given labels.
    ///
    /// A `__name__` entry in `labels` is replaced by `name`.
    #[must_use]
    pub fn new(name: &str, labels: &Labels, value: f64, timestamp: i64) -> Self {
        Self::with_samples(name, labels, vec![Sample { value, timestamp }])
    }

    /// Creates a series named `name` with the given labels and samples.
    #[must_use]
    pub fn with_samples(name: &str, labels: &Labels, samples: Vec<Sample>) -> Self {
        let mut all = labels.clone();
        all.insert(METRIC_NAME_LABEL.to_string(), name.to_string());
        Self {
            labels: map_to_labels(&all),
            samples,
        }
    }

    /// Returns the value of the label `name`.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Returns the metric name of the series.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.label(METRIC_NAME_LABEL)
    }
}

/// The lifecycle state of an alert.
///
/// States are ordered by severity: `Inactive < Pending < Firing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// The alert stopped firing this tick and is removed on the next one.
    Inactive,
    /// The condition is true but hasn't been true long enough to fire.
    Pending,
    /// The alert is actively firing.
    Firing,
}

impl AlertState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Pending => "pending",
            Self::Firing => "firing",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One instance of an alerting rule for one distinct result label set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Hash of the result label set, excluding `__name__`.
    pub id: u64,
    /// ID of the group owning the rule.
    pub group_id: u64,
    /// Alerting rule name.
    pub name: String,
    /// Rendered labels, without `alertname`.
    pub labels: Labels,
    /// Rendered annotations.
    pub annotations: Labels,
    /// Last observed value.
    pub value: f64,
    /// Current state.
    pub state: AlertState,
    /// When the alert became active.
    pub start: DateTime<Utc>,
    /// When the alert became inactive.
    pub resolved_at: Option<DateTime<Utc>>,
    /// End of validity sent to notifiers.
    pub end: Option<DateTime<Utc>>,
    /// When the alert was last handed to notifiers.
    #[serde(default)]
    pub last_sent: Option<DateTime<Utc>>,
    /// Link back to the alert source.
    pub generator_url: String,
    /// Expression that produced the alert.
    pub expr: String,
    /// Whether the alert was restored from persisted state.
    pub restored: bool,
}

impl Alert {
    /// Returns the labels including `alertname`.
    #[must_use]
    pub fn full_labels(&self) -> Labels {
        let mut labels = self.labels.clone();
        labels.insert(ALERT_NAME_LABEL.to_string(), self.name.clone());
        labels
    }

    /// Returns how long the alert has been active at `now`.
    #[must_use]
    pub fn active_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.start)
    }
}

/// Converts a std duration into a chrono delta, saturating on overflow.
#[must_use]
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
