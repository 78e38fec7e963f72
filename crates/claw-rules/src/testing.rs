//! In-memory collaborators for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::datasource::Querier;
use crate::error::{Result, RuleError};
use crate::notifier::Notifier;
use crate::remotewrite::RemoteWrite;
use crate::types::{Alert, Metric, RangeMetric, TimeSeries};

#[derive(Debug, Default)]
pub struct FakeQuerier {
    metrics: Mutex<Vec<Metric>>,
    range: Mutex<Vec<RangeMetric>>,
    error: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    exprs: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeQuerier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, metrics: Vec<Metric>) {
        *self.metrics.lock() = metrics;
    }

    pub fn set_range(&self, range: Vec<RangeMetric>) {
        *self.range.lock() = range;
    }

    pub fn set_error(&self, msg: &str) {
        *self.error.lock() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.error.lock() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn exprs(&self) -> Vec<String> {
        self.exprs.lock().clone()
    }

    async fn before(&self, expr: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.exprs.lock().push(expr.to_string());
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let error = self.error.lock().clone();
        match error {
            Some(reason) => Err(RuleError::Query { reason }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Querier for FakeQuerier {
    async fn query(&self, expr: &str, _ts: DateTime<Utc>) -> Result<Vec<Metric>> {
        self.before(expr).await?;
        Ok(self.metrics.lock().clone())
    }

    async fn query_range(
        &self,
        expr: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<RangeMetric>> {
        self.before(expr).await?;
        Ok(self.range.lock().clone())
    }
}

#[derive(Debug, Default)]
pub struct FakeRemoteWrite {
    series: Mutex<Vec<TimeSeries>>,
}

impl FakeRemoteWrite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn series(&self) -> Vec<TimeSeries> {
        self.series.lock().clone()
    }

    pub fn clear(&self) {
        self.series.lock().clear();
    }
}

impl RemoteWrite for FakeRemoteWrite {
    fn push(&self, series: TimeSeries) -> Result<()> {
        self.series.lock().push(series);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeNotifier {
    addr: String,
    sent: Mutex<Vec<Vec<Alert>>>,
    fail: Mutex<bool>,
}

impl FakeNotifier {
    pub fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            ..Self::default()
        })
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn batches(&self) -> Vec<Vec<Alert>> {
        self.sent.lock().clone()
    }

    pub fn last(&self) -> Vec<Alert> {
        self.sent.lock().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn send(&self, alerts: &[Alert]) -> Result<()> {
        if *self.fail.lock() {
            return Err(RuleError::Notify {
                reason: format!("{} unavailable", self.addr),
            });
        }
        self.sent.lock().push(alerts.to_vec());
        Ok(())
    }
}
