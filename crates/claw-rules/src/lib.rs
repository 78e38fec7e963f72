//! Alerting and recording rule evaluation for Clawbernetes.
//!
//! `claw-rules` periodically runs rule expressions against a metrics
//! datasource, tracks the resulting alerts through their
//! pending/firing/inactive lifecycle, records derived series to remote
//! storage and delivers alerts to Alertmanager-compatible receivers.
//!
//! # Features
//!
//! - **Alerting rules**: per label set state machine with a `for` hold time,
//!   restart-safe through the `ALERTS_FOR_STATE` series
//! - **Recording rules**: derived series with cardinality limits and
//!   duplicate detection
//! - **Groups**: rules sharing one interval, evaluated on their own task with
//!   optional concurrency
//! - **Live reload**: the [`Manager`] patches changed groups in place and keeps
//!   alert state of unchanged rules
//! - **Replay**: backfilling rules over a historical range
//!
//! # Example
//!
//! ```rust
//! use claw_rules::config;
//!
//! let yaml = r#"
//! groups:
//!   - name: node
//!     interval: 30s
//!     rules:
//!       - alert: InstanceDown
//!         expr: up == 0
//!         for: 5m
//! "#;
//! let groups = config::parse(yaml, "node.yml").unwrap();
//! assert_eq!(groups[0].rules[0].name(), "InstanceDown");
//! ```
//!
//! Wiring a manager to real collaborators:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use claw_rules::{Executor, Manager, NotifierRegistry, PrometheusClient, PrometheusClientConfig};
//!
//! let querier = Arc::new(PrometheusClient::new(PrometheusClientConfig::new("http://vm:8428"))?);
//! let notifiers = Arc::new(NotifierRegistry::from_urls(&urls, timeout)?);
//! let manager = Manager::new(Executor::new(querier, notifiers));
//! manager.start(config::load(&paths)?).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod datasource;
pub mod error;
pub mod group;
pub mod hash;
pub mod manager;
pub mod notifier;
pub mod remotewrite;
pub mod replay;
pub mod rule;
pub mod template;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use config::{GroupConfig, RuleConfig, parse_duration};
pub use datasource::{PrometheusClient, PrometheusClientConfig, Querier};
pub use error::{Result, RuleError};
pub use group::{Executor, Group, GroupState, RestoreConfig, resolve_duration};
pub use hash::RuleKind;
pub use manager::Manager;
pub use notifier::{
    AlertManagerClient, AlertUrlGenerator, ConfigWatcher, Notifier, NotifierConfig,
    NotifierRegistry,
};
pub use remotewrite::{RemoteWrite, RemoteWriteClient, RemoteWriteConfig};
pub use replay::{RangeIterator, ReplayConfig, replay};
pub use rule::{AlertingRule, RecordingRule, Rule, RuleState, StateEntry};
pub use template::{DefaultRenderer, TemplateRenderer};
pub use types::{Alert, AlertState, Label, Labels, Metric, RangeMetric, Sample, TimeSeries};
