//! Notifier target discovery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Result, RuleError};
use crate::notifier::config::{DnsSdConfig, StaticConfig};

/// A discovered receiver address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    /// `host:port` of the receiver.
    pub address: String,
    /// Metadata about where the target came from.
    pub labels: BTreeMap<String, String>,
}

impl Target {
    /// Creates a target without metadata.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Adds a metadata label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A source of notifier targets.
#[async_trait]
pub trait Discoverer: Send + Sync + std::fmt::Debug {
    /// Returns the current set of targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be consulted.
    async fn discover(&self) -> Result<Vec<Target>>;
}

/// Targets listed in configuration.
#[derive(Debug, Clone)]
pub struct StaticDiscoverer {
    targets: Vec<Target>,
}

impl StaticDiscoverer {
    /// Collects targets from static config blocks.
    #[must_use]
    pub fn new(configs: &[StaticConfig]) -> Self {
        let targets = configs
            .iter()
            .flat_map(|c| c.targets.iter())
            .map(|t| Target::new(t.clone()).with_label("__sd", "static"))
            .collect();
        Self { targets }
    }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
    async fn discover(&self) -> Result<Vec<Target>> {
        Ok(self.targets.clone())
    }
}

/// Targets resolved from DNS names.
#[derive(Debug, Clone)]
pub struct DnsDiscoverer {
    configs: Vec<DnsSdConfig>,
}

impl DnsDiscoverer {
    /// Creates a discoverer for the given DNS blocks.
    #[must_use]
    pub fn new(configs: Vec<DnsSdConfig>) -> Self {
        Self { configs }
    }
}

#[async_trait]
impl Discoverer for DnsDiscoverer {
    async fn discover(&self) -> Result<Vec<Target>> {
        let mut out = Vec::new();
        let mut failures = Vec::new();
        for cfg in &self.configs {
            for name in &cfg.names {
                match tokio::net::lookup_host((name.as_str(), cfg.port)).await {
                    Ok(addrs) => out.extend(addrs.map(|a| {
                        Target::new(a.to_string())
                            .with_label("__sd", "dns")
                            .with_label("__sd_dns_name", name.clone())
                    })),
                    Err(e) => {
                        warn!(name = %name, error = %e, "dns lookup failed");
                        failures.push(format!("{name}: {e}"));
                    }
                }
            }
        }
        if out.is_empty() && !failures.is_empty() {
            return Err(RuleError::Notify {
                reason: format!("dns discovery failed: {}", failures.join("; ")),
            });
        }
        out.sort();
        out.dedup_by(|a, b| a.address == b.address);
        Ok(out)
    }
}
