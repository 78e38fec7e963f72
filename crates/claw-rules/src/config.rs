//! Rule file configuration.
//!
//! Rule files are YAML documents holding a list of groups:
//!
//! ```yaml
//! groups:
//!   - name: node
//!     interval: 30s
//!     concurrency: 2
//!     labels:
//!       team: infra
//!     rules:
//!       - record: job:up:sum
//!         expr: sum(up) by (job)
//!       - alert: InstanceDown
//!         expr: up == 0
//!         for: 5m
//!         annotations:
//!           summary: "{{ $labels.instance }} is down"
//! ```
//!
//! Unknown fields are rejected, and any validation failure rejects the whole
//! file so that a running configuration is never replaced by a partial one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RuleError};
use crate::hash::{self, RuleKind};
use crate::template::{DefaultRenderer, TemplateRenderer};
use crate::types::Labels;

static DURATION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)y)?(?:(\d+)w)?(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?(?:(\d+)ms)?$")
        .unwrap_or_else(|_| unreachable!())
});

static METRIC_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap_or_else(|_| unreachable!()));

const DURATION_UNITS_MS: [u64; 7] = [
    365 * 24 * 3600 * 1000,
    7 * 24 * 3600 * 1000,
    24 * 3600 * 1000,
    3600 * 1000,
    60 * 1000,
    1000,
    1,
];

const DURATION_SUFFIXES: [&str; 7] = ["y", "w", "d", "h", "m", "s", "ms"];

/// Parses a Prometheus-style duration such as `1h30m`, `500ms` or `2d`.
///
/// A bare `0` is accepted as the zero duration.
///
/// # Errors
///
/// Returns `RuleError::InvalidDuration` if the string is empty or malformed.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(RuleError::InvalidDuration {
            reason: "empty duration string".to_string(),
        });
    }

    let caps = DURATION_REGEX
        .captures(s)
        .ok_or_else(|| RuleError::InvalidDuration {
            reason: format!("not a valid duration string: {s:?}"),
        })?;

    let mut total_ms: u64 = 0;
    for (i, unit) in DURATION_UNITS_MS.iter().enumerate() {
        if let Some(m) = caps.get(i + 1) {
            let n: u64 = m.as_str().parse().map_err(|_| RuleError::InvalidDuration {
                reason: format!("number out of range in {s:?}"),
            })?;
            total_ms = n
                .checked_mul(*unit)
                .and_then(|v| total_ms.checked_add(v))
                .ok_or_else(|| RuleError::InvalidDuration {
                    reason: format!("duration out of range: {s:?}"),
                })?;
        }
    }
    Ok(Duration::from_millis(total_ms))
}

/// Formats a duration in the notation accepted by [`parse_duration`].
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let mut ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, suffix) in DURATION_UNITS_MS.iter().zip(DURATION_SUFFIXES) {
        let n = ms / unit;
        if n > 0 {
            out.push_str(&n.to_string());
            out.push_str(suffix);
            ms %= unit;
        }
    }
    out
}

/// Serde adapter for Prometheus-style durations.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    /// Serializes a duration as a string like `1m30s`.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    /// Deserializes a duration from a string or a number of seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Text(t) => super::parse_duration(&t).map_err(serde::de::Error::custom),
            Raw::Seconds(n) => Ok(Duration::from_secs(n)),
        }
    }

    /// Optional variant.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serializes an optional duration.
        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        /// Deserializes an optional duration.
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<super::Raw>::deserialize(d)?
                .map(|raw| match raw {
                    super::Raw::Text(t) => {
                        super::super::parse_duration(&t).map_err(serde::de::Error::custom)
                    }
                    super::Raw::Seconds(n) => Ok(Duration::from_secs(n)),
                })
                .transpose()
        }
    }
}

/// A single rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Metric name for recording rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    /// Alert name for alerting rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    /// Query expression.
    #[serde(default)]
    pub expr: String,
    /// How long the condition must hold before firing.
    #[serde(rename = "for", default, with = "duration_serde")]
    pub for_duration: Duration,
    /// Labels added to produced series or alerts.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    /// Annotations attached to alerts.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub annotations: Labels,
}

impl RuleConfig {
    /// Creates an alerting rule definition.
    #[must_use]
    pub fn alerting(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            record: None,
            alert: Some(name.into()),
            expr: expr.into(),
            for_duration: Duration::ZERO,
            labels: Labels::new(),
            annotations: Labels::new(),
        }
    }

    /// Creates a recording rule definition.
    #[must_use]
    pub fn recording(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            record: Some(name.into()),
            alert: None,
            expr: expr.into(),
            for_duration: Duration::ZERO,
            labels: Labels::new(),
            annotations: Labels::new(),
        }
    }

    /// Sets the `for` duration.
    #[must_use]
    pub const fn with_for(mut self, d: Duration) -> Self {
        self.for_duration = d;
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Returns the rule name according to its kind.
    #[must_use]
    pub fn name(&self) -> &str {
        self.record
            .as_deref()
            .or(self.alert.as_deref())
            .unwrap_or_default()
    }

    /// Returns the rule kind.
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        if self.record.is_some() {
            RuleKind::Recording
        } else {
            RuleKind::Alerting
        }
    }

    /// Returns the content ID of the rule.
    #[must_use]
    pub fn id(&self) -> u64 {
        hash::rule_id(&self.expr, self.kind(), self.name(), &self.labels)
    }

    /// Validates the rule definition.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRule` if the definition is inconsistent or
    /// an alerting rule carries a template that can't be rendered.
    pub fn validate(&self) -> Result<()> {
        let name = match (&self.record, &self.alert) {
            (Some(n), None) | (None, Some(n)) if !n.is_empty() => n,
            _ => {
                return Err(RuleError::InvalidRule {
                    reason: "either `record` or `alert` must be set".to_string(),
                });
            }
        };
        if self.expr.trim().is_empty() {
            return Err(RuleError::InvalidRule {
                reason: format!("expression can't be empty for rule {name:?}"),
            });
        }
        if self.record.is_some() {
            if !METRIC_NAME_REGEX.is_match(name) {
                return Err(RuleError::InvalidRule {
                    reason: format!("invalid metric name {name:?} for recording rule"),
                });
            }
            if !self.for_duration.is_zero() || !self.annotations.is_empty() {
                return Err(RuleError::InvalidRule {
                    reason: format!("recording rule {name:?} can't have `for` or annotations"),
                });
            }
            return Ok(());
        }

        let renderer = DefaultRenderer::new();
        for templates in [&self.labels, &self.annotations] {
            renderer.validate(templates).map_err(|e| RuleError::InvalidRule {
                reason: format!("invalid template in alerting rule {name:?}: {e}"),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Display for RuleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} rule {:?}; expr: {:?}", self.kind(), self.name(), self.expr)?;
        if !self.labels.is_empty() {
            let kv: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "; labels: {}", kv.join(", "))?;
        }
        Ok(())
    }
}

/// A group of rules sharing one evaluation interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Group name, unique within its file.
    pub name: String,
    /// File the group was loaded from.
    #[serde(skip)]
    pub file: String,
    /// Evaluation interval; the global default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_serde::option")]
    pub interval: Option<Duration>,
    /// Max number of rules evaluated concurrently.
    #[serde(default)]
    pub concurrency: usize,
    /// Max number of series or alerts a single rule may produce, 0 for no limit.
    #[serde(default)]
    pub limit: usize,
    /// Labels added to every rule of the group.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    /// Rules in evaluation order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Checksum of the group definition.
    #[serde(skip)]
    pub checksum: u64,
}

impl GroupConfig {
    /// Creates an empty group definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: String::new(),
            interval: None,
            concurrency: 0,
            limit: 0,
            labels: Labels::new(),
            rules: Vec::new(),
            checksum: 0,
        }
    }

    /// Sets the source file.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    /// Sets the evaluation interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Sets the concurrency.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the per-rule limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Adds a group label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Appends a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: RuleConfig) -> Self {
        self.rules.push(rule);
        self
    }

    /// Computes and stores the checksum of the definition.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }

    /// Returns the identity of the group.
    #[must_use]
    pub fn id(&self) -> u64 {
        hash::group_id(&self.file, &self.name)
    }

    /// Hashes the serialized definition.
    #[must_use]
    pub fn compute_checksum(&self) -> u64 {
        match serde_json::to_vec(self) {
            Ok(bytes) => hash::checksum(&bytes),
            Err(e) => {
                warn!(group = %self.name, error = %e, "failed to serialize group for checksum");
                0
            }
        }
    }

    /// Validates the group and its rules.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RuleError::InvalidConfig {
                reason: "group name must be set".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id()) {
                return Err(RuleError::InvalidConfig {
                    reason: format!("{rule} is a duplicate in group {:?}", self.name),
                });
            }
            rule.validate().map_err(|e| RuleError::InvalidConfig {
                reason: format!("invalid rule in group {:?}: {e}", self.name),
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    groups: Vec<GroupConfig>,
}

/// Parses and validates the content of one rule file.
///
/// # Errors
///
/// Returns an error if the YAML is malformed, contains unknown fields, or any
/// group fails validation.
pub fn parse(content: &str, file: &str) -> Result<Vec<GroupConfig>> {
    let parsed: RuleFile = serde_yaml::from_str(content).map_err(|e| RuleError::InvalidConfig {
        reason: format!("failed to parse file {file:?}: {e}"),
    })?;

    let mut names = HashSet::new();
    let mut groups = Vec::with_capacity(parsed.groups.len());
    for mut group in parsed.groups {
        group.validate().map_err(|e| RuleError::InvalidConfig {
            reason: format!("invalid group {:?} in file {file:?}: {e}", group.name),
        })?;
        if !names.insert(group.name.clone()) {
            return Err(RuleError::InvalidConfig {
                reason: format!("group name {:?} duplicate in file {file:?}", group.name),
            });
        }
        group.file = file.to_string();
        group.checksum = group.compute_checksum();
        groups.push(group);
    }
    Ok(groups)
}

/// Reads and parses one rule file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is invalid.
pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<GroupConfig>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| RuleError::InvalidConfig {
        reason: format!("failed to read file '{}': {e}", path.display()),
    })?;
    parse(&content, &path.display().to_string())
}

/// Loads all rule files and returns their groups sorted by file and name.
///
/// # Errors
///
/// Returns the first error encountered; no groups are returned in that case.
pub fn load(paths: &[PathBuf]) -> Result<Vec<GroupConfig>> {
    let mut groups = Vec::new();
    for path in paths {
        groups.extend(load_file(path)?);
    }
    if groups.is_empty() {
        warn!(paths = ?paths, "no groups found");
    }
    groups.sort_by(|a, b| a.file.cmp(&b.file).then_with(|| a.name.cmp(&b.name)));
    debug!(groups = groups.len(), "loaded rule files");
    Ok(groups)
}
