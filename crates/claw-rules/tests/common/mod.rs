//! Shared in-memory collaborators for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claw_rules::{
    Alert, Metric, Notifier, Querier, RangeMetric, RemoteWrite, Result, RuleError, TimeSeries,
};
use parking_lot::Mutex;

// ==================== Querier ====================

/// Answers queries from a per-expression table.
#[derive(Debug, Default)]
pub struct TableQuerier {
    instant: Mutex<HashMap<String, Vec<Metric>>>,
    range: Mutex<HashMap<String, Vec<RangeMetric>>>,
    failing: Mutex<bool>,
}

impl TableQuerier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, expr: &str, rows: Vec<Metric>) {
        self.instant.lock().insert(expr.to_string(), rows);
    }

    pub fn set_range(&self, expr: &str, rows: Vec<RangeMetric>) {
        self.range.lock().insert(expr.to_string(), rows);
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl Querier for TableQuerier {
    async fn query(&self, expr: &str, _ts: DateTime<Utc>) -> Result<Vec<Metric>> {
        if *self.failing.lock() {
            return Err(RuleError::Query {
                reason: "datasource unavailable".into(),
            });
        }
        Ok(self.instant.lock().get(expr).cloned().unwrap_or_default())
    }

    async fn query_range(
        &self,
        expr: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<RangeMetric>> {
        if *self.failing.lock() {
            return Err(RuleError::Query {
                reason: "datasource unavailable".into(),
            });
        }
        Ok(self.range.lock().get(expr).cloned().unwrap_or_default())
    }
}

// ==================== Remote write ====================

#[derive(Debug, Default)]
pub struct MemoryWrite {
    series: Mutex<Vec<TimeSeries>>,
}

impl MemoryWrite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<TimeSeries> {
        std::mem::take(&mut *self.series.lock())
    }

    pub fn len(&self) -> usize {
        self.series.lock().len()
    }
}

impl RemoteWrite for MemoryWrite {
    fn push(&self, series: TimeSeries) -> Result<()> {
        self.series.lock().push(series);
        Ok(())
    }
}

// ==================== Notifier ====================

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    batches: Mutex<Vec<Vec<Alert>>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<Vec<Alert>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn addr(&self) -> &str {
        "memory"
    }

    async fn send(&self, alerts: &[Alert]) -> Result<()> {
        self.batches.lock().push(alerts.to_vec());
        Ok(())
    }
}

// ==================== Helpers ====================

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
}

pub fn row(labels: &[(&str, &str)], value: f64) -> Metric {
    Metric::new(labels.iter().copied(), value)
}
