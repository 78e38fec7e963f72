//! Historical evaluation of rules for backfilling.
//!
//! Replay walks `[from, to]` in chunks of `interval * max_datapoints` and
//! evaluates every rule of every group over each chunk with a range query,
//! pushing the produced series to remote write. Rules run one after another;
//! a delay between rules gives the sink time to persist recorded series that
//! later rules may read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GroupConfig;
use crate::datasource::Querier;
use crate::error::{Result, RuleError};
use crate::group::Group;
use crate::remotewrite::RemoteWrite;
use crate::rule::Rule;
use crate::template::TemplateRenderer;
use crate::types::to_delta;

/// Splits `[start, end]` into consecutive chunks of at most `step`.
///
/// Chunks share their boundaries. If the last regular chunk had to be cut
/// short at `end`, one more empty chunk `[end, end]` closes the range.
#[derive(Debug, Clone)]
pub struct RangeIterator {
    current: DateTime<Utc>,
    end: DateTime<Utc>,
    step: Duration,
    clamped: bool,
    done: bool,
}

impl RangeIterator {
    /// Creates an iterator. A zero `step` or `start >= end` yields nothing.
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Self {
        Self {
            current: start,
            end,
            step,
            clamped: false,
            done: step.is_zero() || start >= end,
        }
    }
}

impl Iterator for RangeIterator {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.current < self.end {
            let start = self.current;
            let mut end = start + to_delta(self.step);
            if end > self.end {
                end = self.end;
                self.clamped = true;
            }
            self.current = end;
            return Some((start, end));
        }
        self.done = true;
        self.clamped.then_some((self.end, self.end))
    }
}

/// Parameters of a replay run.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Start of the replayed range.
    pub from: DateTime<Utc>,
    /// End of the replayed range.
    pub to: DateTime<Utc>,
    /// Max data points per range query; the chunk size is
    /// `interval * max_datapoints`.
    pub max_datapoints: u32,
    /// Attempts per rule and chunk before giving up.
    pub rule_retry_attempts: u32,
    /// Pause between failed attempts.
    pub retry_delay: Duration,
    /// Pause between consecutive rules.
    pub rules_delay: Duration,
    /// Interval of groups that do not define one.
    pub default_interval: Duration,
}

impl ReplayConfig {
    /// Creates a config for `[from, to]` with default tuning.
    #[must_use]
    pub const fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            max_datapoints: 1000,
            rule_retry_attempts: 5,
            retry_delay: Duration::from_secs(1),
            rules_delay: Duration::from_secs(1),
            default_interval: Duration::from_secs(60),
        }
    }

    /// Checks the config for consistency.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` on the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.from >= self.to {
            return Err(RuleError::InvalidConfig {
                reason: format!("replay from {} must be before to {}", self.from, self.to),
            });
        }
        if self.max_datapoints == 0 {
            return Err(RuleError::InvalidConfig {
                reason: "max datapoints must be positive".to_string(),
            });
        }
        if self.rule_retry_attempts == 0 {
            return Err(RuleError::InvalidConfig {
                reason: "rule retry attempts must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Replays `groups` over the configured range.
///
/// Returns the number of samples pushed.
///
/// # Errors
///
/// Fails on invalid config, when a rule keeps failing after all attempts, when
/// a push fails, or with `RuleError::Cancelled` once `cancel` fires.
pub async fn replay(
    groups: &[GroupConfig],
    querier: &dyn Querier,
    rw: &dyn RemoteWrite,
    renderer: &Arc<dyn TemplateRenderer>,
    cfg: &ReplayConfig,
    cancel: &CancellationToken,
) -> Result<usize> {
    cfg.validate()?;
    info!(from = %cfg.from, to = %cfg.to, groups = groups.len(), "replay started");

    let mut total = 0;
    for group_cfg in groups {
        let group = Group::new(group_cfg, cfg.default_interval, renderer);
        let interval = group.interval();
        let step = interval * cfg.max_datapoints;
        let rules = group.rules();
        info!(
            group = %group.name(),
            rules = rules.len(),
            interval = ?interval,
            chunks = RangeIterator::new(cfg.from, cfg.to, step).count(),
            "replaying group"
        );

        for (i, rule) in rules.iter().enumerate() {
            if i > 0 && !cfg.rules_delay.is_zero() {
                sleep_or_cancel(cfg.rules_delay, cancel).await?;
            }
            let mut samples = 0;
            for (start, end) in RangeIterator::new(cfg.from, cfg.to, step) {
                if start == end {
                    continue;
                }
                samples += replay_chunk(rule, querier, rw, start, end, interval, cfg, cancel).await?;
            }
            info!(group = %group.name(), rule = %rule.name(), samples, "rule replayed");
            total += samples;
        }
    }
    info!(samples = total, "replay finished");
    Ok(total)
}

#[allow(clippy::too_many_arguments)]
async fn replay_chunk(
    rule: &Rule,
    querier: &dyn Querier,
    rw: &dyn RemoteWrite,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: Duration,
    cfg: &ReplayConfig,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut attempt = 1;
    let series = loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        match rule.exec_range(querier, start, end, interval).await {
            Ok(series) => break series,
            Err(e) if attempt < cfg.rule_retry_attempts => {
                warn!(
                    rule = %rule.name(),
                    attempt,
                    error = %e,
                    "range evaluation failed, retrying"
                );
                attempt += 1;
                sleep_or_cancel(cfg.retry_delay, cancel).await?;
            }
            Err(e) => {
                return Err(RuleError::Query {
                    reason: format!(
                        "rule {:?} failed on [{start}, {end}] after {attempt} attempts: {e}",
                        rule.name()
                    ),
                });
            }
        }
    };

    let mut samples = 0;
    for s in series {
        samples += s.samples.len();
        rw.push(s)?;
    }
    Ok(samples)
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(cancelled()),
        () = tokio::time::sleep(d) => Ok(()),
    }
}

fn cancelled() -> RuleError {
    RuleError::Cancelled {
        what: "replay".to_string(),
    }
}
