//! Command line interface.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Evaluates alerting and recording rules against a metrics datasource
#[derive(Debug, Parser)]
#[command(name = "claw-ruler")]
#[command(version)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "CLAW_RULER_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Log line encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the rule evaluation loop until interrupted
    Run(RunArgs),

    /// Evaluate rules over a historical range and write results to remote storage
    Replay(ReplayArgs),

    /// Parse and validate rule files, then exit
    Check {
        /// Rule files to validate
        #[arg(short, long = "rule", required = true, num_args = 1.., env = "CLAW_RULER_RULE", value_delimiter = ',')]
        rules: Vec<PathBuf>,
    },
}

/// Flags shared by every mode that queries the datasource.
#[derive(Debug, Args)]
pub struct DatasourceArgs {
    /// Rule files to load
    #[arg(short, long = "rule", required = true, num_args = 1.., env = "CLAW_RULER_RULE", value_delimiter = ',')]
    pub rules: Vec<PathBuf>,

    /// Datasource URL answering Prometheus query API requests
    #[arg(long, env = "CLAW_RULER_DATASOURCE_URL")]
    pub datasource_url: String,

    /// Timeout for datasource requests
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub datasource_timeout: Duration,

    /// Shifts instant query timestamps this far into the past
    #[arg(long, default_value = "0s", value_parser = parse_duration)]
    pub datasource_lookback: Duration,

    /// Default evaluation interval for groups without one
    #[arg(long, default_value = "1m", env = "CLAW_RULER_EVALUATION_INTERVAL", value_parser = parse_interval)]
    pub evaluation_interval: Duration,

    /// Remote write URL for recorded series and alert state
    #[arg(long, env = "CLAW_RULER_REMOTE_WRITE_URL")]
    pub remote_write_url: Option<String>,
}

/// Flags of the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub datasource: DatasourceArgs,

    /// Remote read URL used to restore alert state on startup
    #[arg(long, env = "CLAW_RULER_REMOTE_READ_URL")]
    pub remote_read_url: Option<String>,

    /// How far back to look for alert state when restoring
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub remote_read_lookback: Duration,

    /// Alertmanager base URL, may be repeated
    #[arg(long = "notifier-url", env = "CLAW_RULER_NOTIFIER_URL", value_delimiter = ',', conflicts_with = "notifier_config")]
    pub notifier_urls: Vec<String>,

    /// Notifier configuration file with static and DNS discovered targets
    #[arg(long, env = "CLAW_RULER_NOTIFIER_CONFIG")]
    pub notifier_config: Option<PathBuf>,

    /// Timeout for requests to notifiers given by --notifier-url
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub notifier_timeout: Duration,

    /// URL advertised in generator links of sent alerts
    #[arg(long, default_value = "http://localhost:8880", env = "CLAW_RULER_EXTERNAL_URL")]
    pub external_url: String,

    /// Minimum delay between resends of a firing alert
    #[arg(long, default_value = "0s", value_parser = parse_duration)]
    pub rule_resend_delay: Duration,
}

/// Flags of the `replay` subcommand.
#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub datasource: DatasourceArgs,

    /// Start of the range, RFC 3339
    #[arg(long, value_parser = parse_timestamp)]
    pub from: DateTime<Utc>,

    /// End of the range, RFC 3339
    #[arg(long, value_parser = parse_timestamp)]
    pub to: DateTime<Utc>,

    /// Max datapoints per range query
    #[arg(long, default_value_t = 1000)]
    pub max_datapoints: u32,

    /// Attempts per range query before giving up
    #[arg(long = "replay-rule-retry-attempts", default_value_t = 5)]
    pub rule_retry_attempts: u32,

    /// Pause between rules
    #[arg(long = "replay-rules-delay", default_value = "1s", value_parser = parse_duration)]
    pub rules_delay: Duration,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    claw_rules::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let d = parse_duration(s)?;
    if d.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(d)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp {s:?}: {e}"))
}
