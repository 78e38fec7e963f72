//! Alertmanager v2 API client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, RuleError};
use crate::notifier::Notifier;
use crate::types::{Alert, Labels};

/// Alert as accepted by `POST /api/v2/alerts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    /// Labels including `alertname`.
    pub labels: Labels,
    /// Annotations.
    pub annotations: Labels,
    /// RFC 3339 start time.
    pub starts_at: String,
    /// RFC 3339 end time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
    /// Link back to the alert source.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
}

impl AlertPayload {
    /// Converts an alert into its wire representation.
    #[must_use]
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            labels: alert.full_labels(),
            annotations: alert.annotations.clone(),
            starts_at: alert.start.to_rfc3339(),
            ends_at: alert.end.map(|e| e.to_rfc3339()),
            generator_url: alert.generator_url.clone(),
        }
    }
}

/// Sends alerts to one Alertmanager instance.
#[derive(Debug)]
pub struct AlertManagerClient {
    addr: String,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl AlertManagerClient {
    /// Creates a client posting to the full alerts endpoint `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            addr: addr.into(),
            client,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Notifier for AlertManagerClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn send(&self, alerts: &[Alert]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuleError::Closed {
                what: format!("notifier {}", self.addr),
            });
        }
        if alerts.is_empty() {
            return Ok(());
        }

        let payload: Vec<AlertPayload> = alerts.iter().map(AlertPayload::from_alert).collect();
        let response = self
            .client
            .post(&self.addr)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RuleError::Notify {
                reason: format!("failed to send alerts to {}: {e}", self.addr),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuleError::Notify {
                reason: format!(
                    "invalid response code {status} from {}; response body: {body:?}",
                    self.addr
                ),
            });
        }
        debug!(addr = %self.addr, alerts = alerts.len(), "sent alerts");
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
