//! Remote storage sink for recording-rule output and alert state series.
//!
//! [`RemoteWriteClient`] queues series in a bounded channel and flushes them
//! in batches from a fixed number of worker tasks. Pushing never blocks: when
//! the queue is full the series is dropped and an error is returned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RuleError};
use crate::types::{METRIC_NAME_LABEL, TimeSeries};

/// Destination for produced time series.
pub trait RemoteWrite: Send + Sync + std::fmt::Debug {
    /// Enqueues a series for delivery.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::RemoteWrite` if the series cannot be accepted.
    fn push(&self, series: TimeSeries) -> Result<()>;
}

/// Configuration for [`RemoteWriteClient`].
#[derive(Debug, Clone)]
pub struct RemoteWriteConfig {
    /// Base URL of the storage, e.g. `http://localhost:8428`.
    pub url: String,
    /// Number of concurrent flush workers.
    pub concurrency: usize,
    /// Max number of series sent in one request.
    pub max_batch_size: usize,
    /// Max number of series waiting in the queue.
    pub max_queue_size: usize,
    /// How often partially filled batches are flushed.
    pub flush_interval: Duration,
    /// Request timeout.
    pub send_timeout: Duration,
    /// Initial delay between retries; doubled after each attempt.
    pub retry_min_interval: Duration,
    /// Max total time spent retrying one batch.
    pub retry_max_time: Duration,
}

impl RemoteWriteConfig {
    /// Creates a configuration with defaults for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            concurrency: 4,
            max_batch_size: 1_000,
            max_queue_size: 100_000,
            flush_interval: Duration::from_secs(5),
            send_timeout: Duration::from_secs(30),
            retry_min_interval: Duration::from_secs(1),
            retry_max_time: Duration::from_secs(30),
        }
    }
}

/// Batching HTTP client pushing series in Prometheus text format.
#[derive(Debug)]
pub struct RemoteWriteClient {
    sender: Mutex<Option<mpsc::Sender<TimeSeries>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_queue_size: usize,
}

struct Flusher {
    client: reqwest::Client,
    endpoint: String,
    max_batch_size: usize,
    flush_interval: Duration,
    retry_min_interval: Duration,
    retry_max_time: Duration,
}

impl RemoteWriteClient {
    /// Creates the client and starts its workers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` if the URL is empty or the HTTP
    /// client cannot be built.
    pub fn new(config: RemoteWriteConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(RuleError::InvalidConfig {
                reason: "remote write url can't be empty".to_string(),
            });
        }
        let max_queue_size = config.max_queue_size.max(1);
        let (tx, rx) = mpsc::channel(max_queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let client = reqwest::Client::builder()
            .timeout(config.send_timeout)
            .build()?;
        let flusher = Arc::new(Flusher {
            client,
            endpoint: format!(
                "{}/api/v1/import/prometheus",
                config.url.trim_end_matches('/')
            ),
            max_batch_size: config.max_batch_size.max(1),
            flush_interval: config.flush_interval,
            retry_min_interval: config.retry_min_interval,
            retry_max_time: config.retry_max_time,
        });

        let workers = (0..config.concurrency.max(1))
            .map(|_| {
                let flusher = Arc::clone(&flusher);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { flusher.run(rx).await })
            })
            .collect();

        info!(url = %config.url, concurrency = config.concurrency.max(1), "started remote write client");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            max_queue_size,
        })
    }

    /// Stops accepting series, flushes everything queued and waits for the workers.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Closed` if the client was already closed.
    pub async fn close(&self) -> Result<()> {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return Err(RuleError::Closed {
                what: "remote write client".to_string(),
            });
        }
        drop(sender);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "remote write worker terminated abnormally");
            }
        }
        info!("remote write client closed");
        Ok(())
    }
}

impl RemoteWrite for RemoteWriteClient {
    fn push(&self, series: TimeSeries) -> Result<()> {
        let guard = self.sender.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(RuleError::Closed {
                what: "remote write client".to_string(),
            });
        };
        tx.try_send(series).map_err(|e| match e {
            TrySendError::Full(_) => RuleError::RemoteWrite {
                reason: format!(
                    "failed to push timeseries - queue is full ({} entries)",
                    self.max_queue_size
                ),
            },
            TrySendError::Closed(_) => RuleError::Closed {
                what: "remote write client".to_string(),
            },
        })
    }
}

impl Flusher {
    async fn run(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TimeSeries>>>) {
        let mut batch = Vec::with_capacity(self.max_batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval.max(Duration::from_millis(1)));
        ticker.tick().await;

        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    item = rx.recv() => Some(item),
                    _ = ticker.tick() => None,
                }
            };
            match next {
                Some(Some(series)) => {
                    batch.push(series);
                    if batch.len() >= self.max_batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                Some(None) => {
                    let n = batch.len();
                    self.flush(&mut batch).await;
                    debug!(series = n, "remote write worker flushed remaining series");
                    return;
                }
                None => self.flush(&mut batch).await,
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<TimeSeries>) {
        if batch.is_empty() {
            return;
        }
        let body = encode(batch);
        let started = Instant::now();
        let mut retry_interval = self.retry_min_interval.min(self.retry_max_time);

        for attempt in 1.. {
            match self.send(body.clone()).await {
                Ok(()) => {
                    debug!(series = batch.len(), "flushed series to remote storage");
                    batch.clear();
                    return;
                }
                Err(SendError::Permanent(reason)) => {
                    warn!(attempt, error = %reason, retriable = false, "remote write request failed");
                    break;
                }
                Err(SendError::Retriable(reason)) => {
                    warn!(attempt, error = %reason, retriable = true, "remote write request failed");
                }
            }
            let left = self.retry_max_time.saturating_sub(started.elapsed());
            if left.is_zero() {
                break;
            }
            tokio::time::sleep(retry_interval.min(left)).await;
            retry_interval *= 2;
        }

        error!(series = batch.len(), "attempts to send remote-write request failed - dropping series");
        batch.clear();
    }

    async fn send(&self, body: String) -> std::result::Result<(), SendError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| SendError::Retriable(format!("error while sending request to {}: {e}", self.endpoint)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let reason = format!("unexpected response code {status} for {}. Response body {text:?}", self.endpoint);
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SendError::Permanent(reason))
        } else {
            Err(SendError::Retriable(reason))
        }
    }
}

enum SendError {
    Retriable(String),
    Permanent(String),
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

fn escape_label_value(v: &str) -> String {
    v.replace('\\', r"\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Encodes series in the Prometheus text exposition format with timestamps.
fn encode(batch: &[TimeSeries]) -> String {
    let mut out = String::new();
    for series in batch {
        let name = series.name().unwrap_or_default();
        let labels: Vec<String> = series
            .labels
            .iter()
            .filter(|l| l.name != METRIC_NAME_LABEL)
            .map(|l| format!("{}=\"{}\"", l.name, escape_label_value(&l.value)))
            .collect();
        for sample in &series.samples {
            out.push_str(name);
            if !labels.is_empty() {
                out.push('{');
                out.push_str(&labels.join(","));
                out.push('}');
            }
            out.push(' ');
            out.push_str(&format_value(sample.value));
            out.push(' ');
            out.push_str(&sample.timestamp.to_string());
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Labels;

    fn series(name: &str, job: &str, value: f64) -> TimeSeries {
        let mut labels = Labels::new();
        labels.insert("job".into(), job.into());
        TimeSeries::new(name, &labels, value, 1_000)
    }

    mod encode_tests {
        use super::*;

        #[test]
        fn encodes_text_format() {
            let out = encode(&[series("up", "api", 1.0)]);
            assert_eq!(out, "up{job=\"api\"} 1 1000\n");
        }

        #[test]
        fn escapes_values_and_nan() {
            let out = encode(&[series("x", "a\"b", f64::NAN)]);
            assert_eq!(out, "x{job=\"a\\\"b\"} NaN 1000\n");
        }

        #[test]
        fn series_without_labels() {
            let ts = TimeSeries::new("bare", &Labels::new(), 2.5, 7);
            assert_eq!(encode(&[ts]), "bare 2.5 7\n");
        }
    }

    mod client_tests {
        use super::*;
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::post;

        async fn serve(store: Arc<Mutex<Vec<String>>>, status: StatusCode) -> String {
            let app = Router::new().route(
                "/api/v1/import/prometheus",
                post(move |body: String| {
                    let store = Arc::clone(&store);
                    async move {
                        store.lock().push(body);
                        status
                    }
                }),
            );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}")
        }

        fn config(url: String) -> RemoteWriteConfig {
            let mut cfg = RemoteWriteConfig::new(url);
            cfg.concurrency = 2;
            cfg.max_batch_size = 10;
            cfg.flush_interval = Duration::from_secs(60);
            cfg.retry_min_interval = Duration::from_millis(10);
            cfg.retry_max_time = Duration::from_millis(50);
            cfg
        }

        #[tokio::test]
        async fn close_flushes_queued_series() {
            let store = Arc::new(Mutex::new(Vec::new()));
            let url = serve(Arc::clone(&store), StatusCode::NO_CONTENT).await;
            let client = RemoteWriteClient::new(config(url)).unwrap();

            for i in 0..5 {
                client.push(series("up", &format!("job{i}"), 1.0)).unwrap();
            }
            client.close().await.unwrap();

            let lines: usize = store.lock().iter().map(|b| b.lines().count()).sum();
            assert_eq!(lines, 5);
        }

        #[tokio::test]
        async fn push_after_close_fails() {
            let store = Arc::new(Mutex::new(Vec::new()));
            let url = serve(store, StatusCode::NO_CONTENT).await;
            let client = RemoteWriteClient::new(config(url)).unwrap();
            client.close().await.unwrap();

            let err = client.push(series("up", "a", 1.0)).unwrap_err();
            assert!(matches!(err, RuleError::Closed { .. }));
            assert!(client.close().await.is_err());
        }

        #[tokio::test]
        async fn full_queue_rejects_push() {
            let mut cfg = RemoteWriteConfig::new("http://127.0.0.1:1");
            cfg.concurrency = 1;
            cfg.max_queue_size = 1;
            cfg.max_batch_size = 100;
            cfg.flush_interval = Duration::from_secs(3600);
            cfg.retry_max_time = Duration::ZERO;
            let client = RemoteWriteClient::new(cfg).unwrap();

            let mut rejected = 0;
            for i in 0..10 {
                if client.push(series("up", &i.to_string(), 1.0)).is_err() {
                    rejected += 1;
                }
            }
            assert!(rejected > 0);
        }

        #[tokio::test]
        async fn client_errors_are_not_retried() {
            let store = Arc::new(Mutex::new(Vec::new()));
            let url = serve(Arc::clone(&store), StatusCode::BAD_REQUEST).await;
            let client = RemoteWriteClient::new(config(url)).unwrap();

            client.push(series("up", "a", 1.0)).unwrap();
            client.close().await.unwrap();
            assert_eq!(store.lock().len(), 1);
        }

        #[test]
        fn empty_url_is_rejected() {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let _guard = rt.enter();
            assert!(RemoteWriteClient::new(RemoteWriteConfig::new("")).is_err());
        }
    }
}
