//! Alerting rule state machine.
//!
//! Each distinct result label set of the rule expression is tracked as one
//! [`Alert`], keyed by the hash of its labels:
//!
//! ```text
//! (absent) --row appears--> Pending
//! Pending  --row present, now - start >= for--> Firing
//! Pending  --row disappears--> (deleted)
//! Firing   --row disappears--> Inactive
//! Inactive --next evaluation--> (deleted, or a new Pending if the row is back)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::RuleConfig;
use crate::datasource::Querier;
use crate::error::{Result, RuleError};
use crate::hash::{self, RuleKind};
use crate::rule::state::{RuleState, StateEntry};
use crate::template::{TemplateData, TemplateRenderer};
use crate::types::{
    ALERT_FOR_STATE_METRIC_NAME, ALERT_METRIC_NAME, ALERT_NAME_LABEL, ALERT_STATE_LABEL, Alert,
    AlertState, Labels, METRIC_NAME_LABEL, Metric, Sample, TimeSeries, labels_to_map,
    map_to_labels, stale_nan, to_delta,
};

/// Mutable definition of an alerting rule, patched in place on reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertingSpec {
    /// Query expression.
    pub expr: String,
    /// How long the condition must hold before firing.
    pub for_duration: Duration,
    /// Label templates, including group labels.
    pub labels: Labels,
    /// Annotation templates.
    pub annotations: Labels,
}

/// A rule producing stateful alerts.
#[derive(Debug)]
pub struct AlertingRule {
    id: u64,
    group_id: u64,
    name: String,
    spec: RwLock<AlertingSpec>,
    alerts: RwLock<HashMap<u64, Alert>>,
    state: RuleState,
    renderer: Arc<dyn TemplateRenderer>,
}

impl AlertingRule {
    /// Creates a rule from its definition.
    ///
    /// `group_labels` are added to the rule labels; rule labels win on conflict.
    #[must_use]
    pub fn new(
        cfg: &RuleConfig,
        group_id: u64,
        group_labels: &Labels,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        let mut labels = group_labels.clone();
        labels.extend(cfg.labels.clone());
        Self {
            id: cfg.id(),
            group_id,
            name: cfg.name().to_string(),
            spec: RwLock::new(AlertingSpec {
                expr: cfg.expr.clone(),
                for_duration: cfg.for_duration,
                labels,
                annotations: cfg.annotations.clone(),
            }),
            alerts: RwLock::new(HashMap::new()),
            state: RuleState::default(),
            renderer,
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

    /// Returns the alert name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the rule kind.
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        RuleKind::Alerting
    }

    /// Returns a snapshot of the current definition.
    #[must_use]
    pub fn spec(&self) -> AlertingSpec {
        self.spec.read().clone()
    }

    /// Returns the evaluation history.
    #[must_use]
    pub const fn state(&self) -> &RuleState {
        &self.state
    }

    /// Returns a snapshot of all alerts ordered by ID.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.read().values().cloned().collect();
        alerts.sort_by_key(|a| a.id);
        alerts
    }

    /// Returns the alert with the given ID.
    #[must_use]
    pub fn alert(&self, id: u64) -> Option<Alert> {
        self.alerts.read().get(&id).cloned()
    }

    /// Replaces the definition with the one of `other`, keeping alert state.
    pub fn update_with(&self, other: &Self) {
        let spec = other.spec.read().clone();
        *self.spec.write() = spec;
        debug!(rule = %self.name, "updated alerting rule definition");
    }

    /// Evaluates the rule at `ts` and advances the state of its alerts.
    ///
    /// When `want_series` is set, the `ALERTS` and `ALERTS_FOR_STATE` series of
    /// every active alert are returned, plus one resolution series for each alert
    /// that became inactive during this evaluation.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or a template fails, leaving alert state
    /// untouched, or `RuleError::LimitExceeded` if more than `limit` alerts are
    /// active, in which case all alerts are dropped.
    pub async fn exec(
        &self,
        querier: &dyn Querier,
        ts: DateTime<Utc>,
        limit: usize,
        want_series: bool,
    ) -> Result<Vec<TimeSeries>> {
        let spec = self.spec();
        let started = Instant::now();

        let metrics = match querier.query(&spec.expr, ts).await {
            Ok(m) => m,
            Err(e) => {
                self.record(ts, started, 0, 0, Some(&e));
                return Err(e);
            }
        };

        let fetched = metrics.len();
        let result = self.apply(&spec, ts, metrics, limit, want_series);
        match &result {
            Ok(_) => {
                let active = self.alerts.read().len();
                self.record(ts, started, active, fetched, None);
            }
            Err(e) => self.record(ts, started, 0, fetched, Some(e)),
        }
        result
    }

    fn record(
        &self,
        at: DateTime<Utc>,
        started: Instant,
        samples: usize,
        series_fetched: usize,
        error: Option<&RuleError>,
    ) {
        if let Some(e) = error {
            warn!(rule = %self.name, error = %e, "alerting rule evaluation failed");
        }
        self.state.add(StateEntry {
            at,
            duration: started.elapsed(),
            samples,
            series_fetched,
            error: error.map(ToString::to_string),
        });
    }

    fn apply(
        &self,
        spec: &AlertingSpec,
        ts: DateTime<Utc>,
        metrics: Vec<Metric>,
        limit: usize,
        want_series: bool,
    ) -> Result<Vec<TimeSeries>> {
        let rows = collapse_rows(metrics);
        let mut alerts = self.alerts.write();

        let mut rendered: HashMap<u64, (Labels, Labels)> = HashMap::new();
        for (h, labels, value) in &rows {
            let unchanged = alerts
                .get(h)
                .is_some_and(|a| a.state != AlertState::Inactive && !value_changed(a.value, *value));
            if !unchanged {
                rendered.insert(*h, self.render(spec, labels, *value)?);
            }
        }

        alerts.retain(|_, a| a.state != AlertState::Inactive);

        let mut touched = HashSet::with_capacity(rows.len());
        for (h, _, value) in rows {
            touched.insert(h);
            if let Some(a) = alerts.get_mut(&h) {
                if let Some((labels, annotations)) = rendered.remove(&h) {
                    a.value = value;
                    a.labels = labels;
                    a.annotations = annotations;
                    a.expr.clone_from(&spec.expr);
                }
                continue;
            }
            let (labels, annotations) = rendered.remove(&h).unwrap_or_default();
            debug!(rule = %self.name, alert_id = h, "new pending alert");
            alerts.insert(
                h,
                Alert {
                    id: h,
                    group_id: self.group_id,
                    name: self.name.clone(),
                    labels,
                    annotations,
                    value,
                    state: AlertState::Pending,
                    start: ts,
                    resolved_at: None,
                    end: None,
                    last_sent: None,
                    generator_url: String::new(),
                    expr: spec.expr.clone(),
                    restored: false,
                },
            );
        }

        alerts.retain(|h, a| {
            if touched.contains(h) {
                return true;
            }
            if a.state == AlertState::Pending {
                debug!(rule = %self.name, alert_id = *h, "pending alert disappeared");
                return false;
            }
            a.state = AlertState::Inactive;
            a.resolved_at = Some(ts);
            info!(rule = %self.name, alert_id = *h, "alert resolved");
            true
        });

        let for_delta = to_delta(spec.for_duration);
        for a in alerts.values_mut() {
            if a.state == AlertState::Pending
                && touched.contains(&a.id)
                && a.active_for(ts) >= for_delta
            {
                a.state = AlertState::Firing;
                info!(rule = %self.name, alert_id = a.id, "alert started firing");
            }
        }

        if limit > 0 {
            let active = alerts
                .values()
                .filter(|a| a.state != AlertState::Inactive)
                .count();
            if active > limit {
                alerts.clear();
                return Err(RuleError::LimitExceeded { limit, got: active });
            }
        }

        if !want_series {
            return Ok(Vec::new());
        }
        Ok(self.series_for(&alerts, spec.for_duration, ts, |_| true))
    }

    fn render(&self, spec: &AlertingSpec, row: &Labels, value: f64) -> Result<(Labels, Labels)> {
        let data = TemplateData {
            labels: row,
            value,
            expr: &spec.expr,
        };
        let rule_labels = self.renderer.render(&spec.labels, &data)?;

        let mut merged = row.clone();
        merged.extend(rule_labels);
        let merged_data = TemplateData {
            labels: &merged,
            value,
            expr: &spec.expr,
        };
        let labels = self.renderer.render(&merged, &merged_data)?;
        let annotations = self.renderer.render(&spec.annotations, &merged_data)?;
        Ok((labels, annotations))
    }

    fn series_for(
        &self,
        alerts: &HashMap<u64, Alert>,
        for_duration: Duration,
        ts: DateTime<Utc>,
        include: impl Fn(&Alert) -> bool,
    ) -> Vec<TimeSeries> {
        let mut selected: Vec<&Alert> = alerts.values().filter(|a| include(a)).collect();
        selected.sort_by_key(|a| a.id);

        let ts_ms = ts.timestamp_millis();
        let mut series = Vec::with_capacity(selected.len() * 2);
        for a in selected {
            let mut labels = a.full_labels();
            if a.state == AlertState::Inactive {
                labels.insert(
                    ALERT_STATE_LABEL.to_string(),
                    AlertState::Firing.as_str().to_string(),
                );
                series.push(TimeSeries::new(ALERT_METRIC_NAME, &labels, stale_nan(), ts_ms));
                continue;
            }
            if !for_duration.is_zero() {
                series.push(TimeSeries::new(
                    ALERT_FOR_STATE_METRIC_NAME,
                    &labels,
                    a.start.timestamp() as f64,
                    ts_ms,
                ));
            }
            labels.insert(ALERT_STATE_LABEL.to_string(), a.state.as_str().to_string());
            series.push(TimeSeries::new(ALERT_METRIC_NAME, &labels, 1.0, ts_ms));
        }
        series
    }

    /// Returns the series to persist after an evaluation at `ts`: firing alerts
    /// and the resolution series of alerts that just became inactive.
    #[must_use]
    pub fn series_to_push(&self, ts: DateTime<Utc>) -> Vec<TimeSeries> {
        let for_duration = self.spec.read().for_duration;
        let alerts = self.alerts.read();
        self.series_for(&alerts, for_duration, ts, |a| a.state != AlertState::Pending)
    }

    /// Returns the alerts due for delivery at `ts` and marks them as sent.
    ///
    /// Pending alerts are never sent. A firing alert is sent when it was never
    /// sent, when the last message about it was a resolution, or once
    /// `resend_delay` has passed since the last send. A resolved alert is sent
    /// once after its resolution. Firing alerts are valid until
    /// `ts + resolve_duration`; resolved ones end at their resolution time.
    pub fn alerts_to_send(
        &self,
        ts: DateTime<Utc>,
        resolve_duration: Duration,
        resend_delay: Duration,
    ) -> Vec<Alert> {
        let valid_until = ts + to_delta(resolve_duration);
        let resend = to_delta(resend_delay);
        let mut alerts = self.alerts.write();
        let mut out: Vec<Alert> = alerts
            .values_mut()
            .filter(|a| needs_sending(a, ts, resend))
            .map(|a| {
                a.end = Some(a.resolved_at.unwrap_or(valid_until));
                a.last_sent = Some(ts);
                a.clone()
            })
            .collect();
        out.sort_by_key(|a| a.id);
        out
    }

    /// Restores pending alerts from `ALERTS_FOR_STATE` series written before a restart.
    ///
    /// Rules without a `for` duration are skipped. Returns the number of restored alerts.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn restore(
        &self,
        querier: &dyn Querier,
        ts: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<usize> {
        let spec = self.spec();
        if spec.for_duration.is_zero() {
            return Ok(0);
        }

        let expr = format!(
            "last_over_time({ALERT_FOR_STATE_METRIC_NAME}{{{ALERT_NAME_LABEL}={:?}}}[{}s])",
            self.name,
            lookback.as_secs().max(1)
        );
        let metrics = querier.query(&expr, ts).await?;

        let mut alerts = self.alerts.write();
        let mut restored = 0;
        for m in metrics {
            let mut labels = labels_to_map(&m.labels);
            labels.remove(METRIC_NAME_LABEL);
            labels.remove(ALERT_NAME_LABEL);

            let mut key = labels.clone();
            for k in spec.labels.keys() {
                key.remove(k);
            }
            let id = hash::map_hash(&key);
            let start = DateTime::from_timestamp(m.value as i64, 0).unwrap_or(ts);

            alerts.insert(
                id,
                Alert {
                    id,
                    group_id: self.group_id,
                    name: self.name.clone(),
                    labels,
                    annotations: Labels::new(),
                    value: f64::NAN,
                    state: AlertState::Pending,
                    start,
                    resolved_at: None,
                    end: None,
                    last_sent: None,
                    generator_url: String::new(),
                    expr: spec.expr.clone(),
                    restored: true,
                },
            );
            restored += 1;
            debug!(rule = %self.name, alert_id = id, start = %start, "restored alert");
        }
        if restored > 0 {
            info!(rule = %self.name, alerts = restored, "restored alerts state");
        }
        Ok(restored)
    }

    /// Replays the state machine over `[start, end]` and returns the produced series.
    ///
    /// A gap between samples larger than `eval_interval` restarts the alert as pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the range query or a template fails.
    pub async fn exec_range(
        &self,
        querier: &dyn Querier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        eval_interval: Duration,
    ) -> Result<Vec<TimeSeries>> {
        let spec = self.spec();
        let series = querier.query_range(&spec.expr, start, end).await?;
        let for_delta = to_delta(spec.for_duration);
        let gap = to_delta(eval_interval);

        let mut out: BTreeMap<Labels, Vec<Sample>> = BTreeMap::new();
        for s in series {
            let Some(first) = s.samples.first() else {
                continue;
            };
            let mut row = labels_to_map(&s.labels);
            row.remove(METRIC_NAME_LABEL);
            let (mut base, _) = self.render(&spec, &row, first.value)?;
            base.insert(ALERT_NAME_LABEL.to_string(), self.name.clone());

            let mut prev: Option<DateTime<Utc>> = None;
            let mut active_at = DateTime::<Utc>::MIN_UTC;
            for sample in &s.samples {
                let Some(at) = DateTime::from_timestamp_millis(sample.timestamp) else {
                    continue;
                };
                let state = if for_delta == TimeDelta::zero() {
                    active_at = at;
                    AlertState::Firing
                } else {
                    match prev {
                        Some(p) if at - p <= gap => {
                            if at - active_at >= for_delta {
                                AlertState::Firing
                            } else {
                                AlertState::Pending
                            }
                        }
                        _ => {
                            active_at = at;
                            AlertState::Pending
                        }
                    }
                };
                prev = Some(at);

                let mut alerts_key = base.clone();
                alerts_key.insert(METRIC_NAME_LABEL.to_string(), ALERT_METRIC_NAME.to_string());
                alerts_key.insert(ALERT_STATE_LABEL.to_string(), state.as_str().to_string());
                out.entry(alerts_key).or_default().push(Sample {
                    value: 1.0,
                    timestamp: sample.timestamp,
                });

                if for_delta > TimeDelta::zero() {
                    let mut for_key = base.clone();
                    for_key.insert(
                        METRIC_NAME_LABEL.to_string(),
                        ALERT_FOR_STATE_METRIC_NAME.to_string(),
                    );
                    out.entry(for_key).or_default().push(Sample {
                        value: active_at.timestamp() as f64,
                        timestamp: sample.timestamp,
                    });
                }
            }
        }

        Ok(out
            .into_iter()
            .map(|(labels, samples)| TimeSeries {
                labels: map_to_labels(&labels),
                samples,
            })
            .collect())
    }
}

fn needs_sending(a: &Alert, ts: DateTime<Utc>, resend: TimeDelta) -> bool {
    let Some(last_sent) = a.last_sent else {
        return a.state != AlertState::Pending;
    };
    match a.state {
        AlertState::Pending => false,
        AlertState::Firing if a.end.is_some_and(|end| end < last_sent) => true,
        AlertState::Inactive if a.resolved_at.is_some_and(|r| r > last_sent) => true,
        _ => last_sent.checked_add_signed(resend).is_some_and(|due| due < ts),
    }
}

#[allow(clippy::float_cmp)]
fn value_changed(old: f64, new: f64) -> bool {
    old != new
}

/// Drops `__name__` and collapses rows with identical label sets, last row wins.
fn collapse_rows(metrics: Vec<Metric>) -> Vec<(u64, Labels, f64)> {
    let mut rows: Vec<(u64, Labels, f64)> = Vec::with_capacity(metrics.len());
    let mut index: HashMap<u64, usize> = HashMap::with_capacity(metrics.len());
    for m in metrics {
        let h = hash::row_hash(&m.labels);
        let mut labels = labels_to_map(&m.labels);
        labels.remove(METRIC_NAME_LABEL);
        match index.get(&h) {
            Some(&i) => rows[i] = (h, labels, m.value),
            None => {
                index.insert(h, rows.len());
                rows.push((h, labels, m.value));
            }
        }
    }
    rows
}
