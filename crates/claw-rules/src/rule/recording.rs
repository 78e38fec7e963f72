//! Recording rules: derive new series from query results.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::RuleConfig;
use crate::datasource::Querier;
use crate::error::{Result, RuleError};
use crate::hash::RuleKind;
use crate::rule::state::{RuleState, StateEntry};
use crate::types::{
    Label, Labels, METRIC_NAME_LABEL, Sample, TimeSeries, format_labels, map_to_labels,
};

/// Mutable definition of a recording rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSpec {
    /// Query expression.
    pub expr: String,
    /// Labels applied to every produced series, including group labels.
    pub labels: Labels,
}

/// A rule that records query results as new series.
#[derive(Debug)]
pub struct RecordingRule {
    id: u64,
    group_id: u64,
    name: String,
    spec: RwLock<RecordingSpec>,
    state: RuleState,
}

impl RecordingRule {
    /// Creates a rule from its definition.
    #[must_use]
    pub fn new(cfg: &RuleConfig, group_id: u64, group_labels: &Labels) -> Self {
        let mut labels = group_labels.clone();
        labels.extend(cfg.labels.clone());
        Self {
            id: cfg.id(),
            group_id,
            name: cfg.name().to_string(),
            spec: RwLock::new(RecordingSpec {
                expr: cfg.expr.clone(),
                labels,
            }),
            state: RuleState::default(),
        }
    }

    /// Returns the content ID of the rule.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the ID of the owning group.
    #[must_use]
    pub const fn group_id(&self) -> u64 {
        self.group_id
    }

    /// Returns the recorded metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the rule kind.
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        RuleKind::Recording
    }

    /// Returns a snapshot of the current definition.
    #[must_use]
    pub fn spec(&self) -> RecordingSpec {
        self.spec.read().clone()
    }

    /// Returns the evaluation history.
    #[must_use]
    pub const fn state(&self) -> &RuleState {
        &self.state
    }

    /// Replaces the definition with the one of `other`.
    pub fn update_with(&self, other: &Self) {
        let spec = other.spec.read().clone();
        *self.spec.write() = spec;
    }

    /// Evaluates the rule at `ts` and returns the series to record.
    ///
    /// # Errors
    ///
    /// Fails the whole evaluation if the query fails, more than `limit` rows
    /// are returned (`0` disables the check), or two rows map to the same
    /// label set.
    pub async fn exec(
        &self,
        querier: &dyn Querier,
        ts: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimeSeries>> {
        let spec = self.spec();
        let started = Instant::now();

        let result = match querier.query(&spec.expr, ts).await {
            Ok(metrics) => {
                let fetched = metrics.len();
                let rows = metrics
                    .into_iter()
                    .map(|m| {
                        (
                            m.labels,
                            vec![Sample {
                                value: m.value,
                                timestamp: ts.timestamp_millis(),
                            }],
                        )
                    })
                    .collect();
                (fetched, self.to_series(&spec, rows, limit))
            }
            Err(e) => (0, Err(e)),
        };

        let (fetched, result) = result;
        let (samples, error) = match &result {
            Ok(series) => (series.len(), None),
            Err(e) => {
                warn!(rule = %self.name, error = %e, "recording rule evaluation failed");
                (0, Some(e.to_string()))
            }
        };
        self.state.add(StateEntry {
            at: ts,
            duration: started.elapsed(),
            samples,
            series_fetched: fetched,
            error,
        });
        result
    }

    /// Evaluates the rule over `[start, end]` and returns the series to record.
    ///
    /// # Errors
    ///
    /// Returns an error if the range query fails or two series collide.
    pub async fn exec_range(
        &self,
        querier: &dyn Querier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>> {
        let spec = self.spec();
        let series = querier.query_range(&spec.expr, start, end).await?;
        let rows = series.into_iter().map(|s| (s.labels, s.samples)).collect();
        self.to_series(&spec, rows, 0)
    }

    fn to_series(
        &self,
        spec: &RecordingSpec,
        rows: Vec<(Vec<Label>, Vec<Sample>)>,
        limit: usize,
    ) -> Result<Vec<TimeSeries>> {
        if limit > 0 && rows.len() > limit {
            return Err(RuleError::LimitExceeded {
                limit,
                got: rows.len(),
            });
        }

        let mut seen: HashSet<Labels> = HashSet::with_capacity(rows.len());
        let mut out = Vec::with_capacity(rows.len());
        for (row, samples) in rows {
            let mut labels: Labels = row
                .into_iter()
                .filter(|l| l.name != METRIC_NAME_LABEL)
                .map(|l| (l.name, l.value))
                .collect();
            labels.extend(spec.labels.clone());
            labels.insert(METRIC_NAME_LABEL.to_string(), self.name.clone());

            if !seen.insert(labels.clone()) {
                return Err(RuleError::DuplicateSeries {
                    labels: format_labels(&labels),
                });
            }
            out.push(TimeSeries {
                labels: map_to_labels(&labels),
                samples,
            });
        }
        debug!(rule = %self.name, series = out.len(), "recording rule produced series");
        Ok(out)
    }
}
