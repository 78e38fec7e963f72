//! Error types for the claw-rules crate.

use thiserror::Error;

/// Errors that can occur while loading, evaluating or dispatching rules.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule file or notifier configuration is invalid.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// The reason the configuration is invalid.
        reason: String,
    },

    /// A single rule definition is invalid.
    #[error("invalid rule: {reason}")]
    InvalidRule {
        /// The reason the rule is invalid.
        reason: String,
    },

    /// The datasource query failed.
    #[error("query failed: {reason}")]
    Query {
        /// The reason the query failed.
        reason: String,
    },

    /// Label or annotation template failed to render.
    #[error("template error: {reason}")]
    Template {
        /// The reason rendering failed.
        reason: String,
    },

    /// Evaluation produced more series or alerts than allowed.
    #[error("exec exceeded limit of {limit} with {got} results")]
    LimitExceeded {
        /// Configured limit.
        limit: usize,
        /// Number of results produced.
        got: usize,
    },

    /// Recording rule produced two series with the same label set.
    #[error("result contains metrics with the same labelset after applying rule labels: {labels}")]
    DuplicateSeries {
        /// The colliding label set.
        labels: String,
    },

    /// Alert delivery to a notifier failed.
    #[error("notification failed: {reason}")]
    Notify {
        /// The reason delivery failed.
        reason: String,
    },

    /// Pushing series to remote storage failed.
    #[error("remote write failed: {reason}")]
    RemoteWrite {
        /// The reason the push failed.
        reason: String,
    },

    /// Invalid duration specification.
    #[error("invalid duration: {reason}")]
    InvalidDuration {
        /// The reason the duration is invalid.
        reason: String,
    },

    /// The component was already shut down.
    #[error("{what} is closed")]
    Closed {
        /// The component that is closed.
        what: String,
    },

    /// A requested group, rule or alert does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing object.
        what: String,
    },

    /// An in-flight operation was interrupted.
    #[error("{what} was cancelled")]
    Cancelled {
        /// The operation that was interrupted.
        what: String,
    },

    /// I/O error while reading configuration.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(String),
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RuleError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for RuleError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result type for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;
