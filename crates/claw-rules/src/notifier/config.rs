//! Notifier target configuration.
//!
//! ```yaml
//! scheme: http
//! path_prefix: /alertmanager
//! timeout: 10s
//! refresh_interval: 30s
//! static_configs:
//!   - targets: ["am-1:9093", "am-2:9093"]
//! dns_sd_configs:
//!   - names: ["alertmanager.svc.cluster.local"]
//!     port: 9093
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::duration_serde;
use crate::error::{Result, RuleError};

const ALERTS_PATH: &str = "/api/v2/alerts";

/// A fixed list of targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    /// `host:port` addresses.
    pub targets: Vec<String>,
}

/// DNS based target discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSdConfig {
    /// Host names to resolve.
    pub names: Vec<String>,
    /// Port appended to every resolved address.
    pub port: u16,
}

fn default_scheme() -> String {
    "http".to_string()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

/// Where and how to deliver alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifierConfig {
    /// Static target lists.
    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,
    /// DNS discovery sources.
    #[serde(default)]
    pub dns_sd_configs: Vec<DnsSdConfig>,
    /// `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Path inserted before `/api/v2/alerts`.
    #[serde(default)]
    pub path_prefix: String,
    /// Per request timeout.
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    /// Period between discovery refreshes.
    #[serde(default = "default_refresh_interval", with = "duration_serde")]
    pub refresh_interval: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            static_configs: Vec::new(),
            dns_sd_configs: Vec::new(),
            scheme: default_scheme(),
            path_prefix: String::new(),
            timeout: default_timeout(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl NotifierConfig {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` if the document is malformed or
    /// fails validation.
    pub fn parse(content: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(content).map_err(|e| RuleError::InvalidConfig {
            reason: format!("invalid notifier config: {e}"),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses a notifier configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content).map_err(|e| RuleError::InvalidConfig {
            reason: format!("{}: {e}", path.as_ref().display()),
        })
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` on the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.scheme != "http" && self.scheme != "https" {
            return Err(RuleError::InvalidConfig {
                reason: format!("unsupported scheme {:?}", self.scheme),
            });
        }
        if self.timeout.is_zero() {
            return Err(RuleError::InvalidConfig {
                reason: "timeout must be positive".to_string(),
            });
        }
        if !self.dns_sd_configs.is_empty() && self.refresh_interval.is_zero() {
            return Err(RuleError::InvalidConfig {
                reason: "refresh_interval must be positive with dns_sd_configs".to_string(),
            });
        }
        for target in self.static_configs.iter().flat_map(|s| &s.targets) {
            self.target_url(target)?;
        }
        for sd in &self.dns_sd_configs {
            if sd.names.is_empty() {
                return Err(RuleError::InvalidConfig {
                    reason: "dns_sd_configs entry without names".to_string(),
                });
            }
            if sd.port == 0 {
                return Err(RuleError::InvalidConfig {
                    reason: format!("dns_sd_configs entry {:?} without port", sd.names),
                });
            }
        }
        Ok(())
    }

    /// Returns the alerts endpoint of `address`.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` if the result is not a valid URL.
    pub fn target_url(&self, address: &str) -> Result<String> {
        let prefix = self.path_prefix.trim_end_matches('/');
        let prefix = if prefix.is_empty() || prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        };
        let raw = format!("{}://{address}{prefix}{ALERTS_PATH}", self.scheme);
        Url::parse(&raw).map_err(|e| RuleError::InvalidConfig {
            reason: format!("invalid notifier target {address:?}: {e}"),
        })?;
        Ok(raw)
    }

    /// Returns `true` if discovery sources need periodic refresh.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        !self.dns_sd_configs.is_empty()
    }
}
