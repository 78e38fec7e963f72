//! Alert delivery to external receivers.
//!
//! - [`Notifier`]: the delivery capability consumed by groups
//! - [`AlertManagerClient`]: Alertmanager v2 HTTP implementation
//! - [`NotifierConfig`] and [`ConfigWatcher`]: target resolution from static
//!   lists or service discovery, refreshed on a timer
//! - [`NotifierRegistry`]: the process-wide set of notifiers passed to the
//!   manager explicitly

pub mod alertmanager;
pub mod config;
pub mod discovery;
pub mod registry;
pub mod watcher;

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Alert;

pub use alertmanager::AlertManagerClient;
pub use config::{DnsSdConfig, NotifierConfig, StaticConfig};
pub use discovery::{Discoverer, DnsDiscoverer, StaticDiscoverer, Target};
pub use registry::NotifierRegistry;
pub use watcher::{ConfigWatcher, NotifierTarget};

/// A receiver of alerts.
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Returns the address alerts are delivered to.
    fn addr(&self) -> &str;

    /// Delivers a batch of alerts.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Notify` on transport errors or non-2xx responses.
    async fn send(&self, alerts: &[Alert]) -> Result<()>;

    /// Releases resources held by the notifier.
    fn close(&self) {}
}

/// Builds the link attached to sent alerts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertUrlGenerator {
    external_url: String,
}

impl AlertUrlGenerator {
    /// Creates a generator for the given external URL.
    #[must_use]
    pub fn new(external_url: impl Into<String>) -> Self {
        Self {
            external_url: external_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Returns the status page URL of `alert`.
    #[must_use]
    pub fn url(&self, alert: &Alert) -> String {
        format!(
            "{}/api/v1/{}/{}/status",
            self.external_url, alert.group_id, alert.id
        )
    }
}
