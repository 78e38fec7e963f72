//! Replay over historical ranges.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use claw_rules::{
    DefaultRenderer, GroupConfig, Label, RangeIterator, RangeMetric, ReplayConfig, RuleConfig,
    Sample, TemplateRenderer, replay,
};
use common::{MemoryWrite, TableQuerier};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

fn t(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
}

fn renderer() -> Arc<dyn TemplateRenderer> {
    Arc::new(DefaultRenderer::new())
}

fn samples(from: DateTime<Utc>, n: i64) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample {
            value: i as f64,
            timestamp: from.timestamp_millis() + i * 60_000,
        })
        .collect()
}

#[test]
fn test_range_iterator_five_minute_steps() {
    let chunks: Vec<_> = RangeIterator::new(t(12, 0), t(12, 30), Duration::from_secs(300)).collect();
    assert_eq!(chunks.len(), 6);
    assert_eq!(chunks.first().unwrap().0, t(12, 0));
    assert_eq!(chunks.last().unwrap().1, t(12, 30));
}

#[test]
fn test_range_iterator_step_longer_than_range() {
    let chunks: Vec<_> =
        RangeIterator::new(t(12, 0), t(12, 30), Duration::from_secs(45 * 60)).collect();
    assert_eq!(chunks, vec![(t(12, 0), t(12, 30)), (t(12, 30), t(12, 30))]);
}

proptest! {
    #[test]
    fn prop_chunks_cover_range_without_gaps(minutes in 1i64..600, step_secs in 1u64..7200) {
        let start = t(0, 0);
        let end = start + chrono::TimeDelta::minutes(minutes);
        let chunks: Vec<_> = RangeIterator::new(start, end, Duration::from_secs(step_secs)).collect();

        prop_assert!(!chunks.is_empty());
        prop_assert_eq!(chunks[0].0, start);
        for w in chunks.windows(2) {
            prop_assert_eq!(w[0].1, w[1].0);
        }
        for (s, e) in &chunks {
            prop_assert!(s <= e);
            prop_assert!(*e <= end);
        }
        prop_assert_eq!(chunks.last().unwrap().1, end);
    }
}

#[tokio::test]
async fn test_replay_chained_rules() {
    let q = TableQuerier::new();
    q.set_range(
        "sum(rate(http_requests_total[5m]))",
        vec![RangeMetric {
            labels: vec![Label::new("job", "api")],
            samples: samples(t(12, 0), 10),
        }],
    );
    q.set_range(
        "job:http_requests:rate5m > 5",
        vec![RangeMetric {
            labels: vec![Label::new("__name__", "job:http_requests:rate5m"), Label::new("job", "api")],
            samples: samples(t(12, 6), 4),
        }],
    );
    let write = MemoryWrite::new();

    let groups = vec![
        GroupConfig::new("api")
            .with_interval(Duration::from_secs(60))
            .with_rule(RuleConfig::recording("job:http_requests:rate5m", "sum(rate(http_requests_total[5m]))"))
            .with_rule(RuleConfig::alerting("HighRate", "job:http_requests:rate5m > 5"))
            .sealed(),
    ];
    let cfg = ReplayConfig {
        max_datapoints: 60,
        rules_delay: Duration::from_millis(5),
        retry_delay: Duration::from_millis(1),
        ..ReplayConfig::new(t(12, 0), t(12, 10))
    };

    let pushed = replay(&groups, q.as_ref(), write.as_ref(), &renderer(), &cfg, &CancellationToken::new())
        .await
        .unwrap();

    // Ten recorded samples plus four ALERTS samples for a rule without `for`.
    assert_eq!(pushed, 14);
    let series = write.take();
    let recorded = series
        .iter()
        .find(|s| s.name() == Some("job:http_requests:rate5m"))
        .unwrap();
    assert_eq!(recorded.label("job"), Some("api"));
    let alerts = series.iter().find(|s| s.name() == Some("ALERTS")).unwrap();
    assert_eq!(alerts.label("alertstate"), Some("firing"));
    assert_eq!(alerts.label("alertname"), Some("HighRate"));
}

#[tokio::test]
async fn test_replay_fails_when_datasource_is_down() {
    let q = TableQuerier::new();
    q.fail(true);
    let write = MemoryWrite::new();
    let groups = vec![
        GroupConfig::new("api")
            .with_rule(RuleConfig::recording("job:up", "up"))
            .sealed(),
    ];
    let cfg = ReplayConfig {
        rule_retry_attempts: 3,
        retry_delay: Duration::from_millis(1),
        ..ReplayConfig::new(t(12, 0), t(12, 10))
    };

    assert!(
        replay(&groups, q.as_ref(), write.as_ref(), &renderer(), &cfg, &CancellationToken::new())
            .await
            .is_err()
    );
    assert_eq!(write.len(), 0);
}
