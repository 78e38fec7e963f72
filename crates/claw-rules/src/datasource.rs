//! Datasource access.
//!
//! Rules never evaluate expressions themselves; they delegate to a [`Querier`].
//! [`PrometheusClient`] implements it against the Prometheus HTTP API
//! (`/api/v1/query` and `/api/v1/query_range`).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Result, RuleError};
use crate::types::{Label, Metric, RangeMetric, Sample};

/// Executes query expressions against a metrics datasource.
#[async_trait]
pub trait Querier: Send + Sync + std::fmt::Debug {
    /// Evaluates `expr` at instant `ts`.
    async fn query(&self, expr: &str, ts: DateTime<Utc>) -> Result<Vec<Metric>>;

    /// Evaluates `expr` over `[start, end]`.
    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RangeMetric>>;
}

/// Configuration for [`PrometheusClient`].
#[derive(Debug, Clone)]
pub struct PrometheusClientConfig {
    /// Base URL of the datasource, e.g. `http://localhost:8428`.
    pub url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Resolution step for range queries and the `step` hint of instant queries.
    pub step: Option<Duration>,
    /// Shifts the evaluation timestamp into the past.
    pub lookback: Duration,
}

impl PrometheusClientConfig {
    /// Creates a configuration with defaults for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
            step: None,
            lookback: Duration::ZERO,
        }
    }

    /// Sets the query step.
    #[must_use]
    pub const fn with_step(mut self, step: Duration) -> Self {
        self.step = Some(step);
        self
    }
}

/// Prometheus HTTP API client.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    client: reqwest::Client,
    base: String,
    config: PrometheusClientConfig,
}

impl PrometheusClient {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` if the URL is malformed.
    pub fn new(config: PrometheusClientConfig) -> Result<Self> {
        let parsed = Url::parse(&config.url).map_err(|e| RuleError::InvalidConfig {
            reason: format!("invalid datasource url {:?}: {e}", config.url),
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
            config,
        })
    }

    /// Returns the base URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.base
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<PromData> {
        let url = format!("{}{path}", self.base);
        let response = match self.client.get(&url).query(params).send().await {
            Ok(r) => r,
            Err(first) => {
                debug!(url = %url, error = %first, "datasource request failed, retrying once");
                self.client
                    .get(&url)
                    .query(params)
                    .send()
                    .await
                    .map_err(|e| RuleError::Query {
                        reason: format!("second attempt: error getting response from {url}: {e}"),
                    })?
            }
        };

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RuleError::Query {
                reason: format!("unexpected response code {status} for {url}. Response body {body}"),
            });
        }
        parse_response(&body)
    }

    fn eval_time(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.checked_sub_signed(crate::types::to_delta(self.config.lookback))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl Querier for PrometheusClient {
    async fn query(&self, expr: &str, ts: DateTime<Utc>) -> Result<Vec<Metric>> {
        let mut params = vec![
            ("query", expr.to_string()),
            ("time", format_ts(self.eval_time(ts))),
        ];
        if let Some(step) = self.config.step {
            params.push(("step", format!("{}s", step.as_secs().max(1))));
        }
        let data = self.get("/api/v1/query", &params).await?;
        data.into_vector()
    }

    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RangeMetric>> {
        if end < start {
            return Err(RuleError::Query {
                reason: format!("end {end} is before start {start}"),
            });
        }
        let step = self.config.step.unwrap_or(Duration::from_secs(60));
        let params = [
            ("query", expr.to_string()),
            ("start", format_ts(start)),
            ("end", format_ts(end)),
            ("step", format!("{}s", step.as_secs().max(1))),
        ];
        let data = self.get("/api/v1/query_range", &params).await?;
        data.into_matrix()
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    let ms = ts.timestamp_millis();
    format!("{}.{:03}", ms.div_euclid(1000), ms.rem_euclid(1000))
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn parse_response(body: &str) -> Result<PromData> {
    let resp: PromResponse = serde_json::from_str(body).map_err(|e| RuleError::Query {
        reason: format!("failed to parse response: {e}"),
    })?;
    if resp.status != "success" {
        return Err(RuleError::Query {
            reason: format!(
                "response error, type: {}, error: {}",
                resp.error_type.unwrap_or_default(),
                resp.error.unwrap_or_default()
            ),
        });
    }
    resp.data.ok_or_else(|| RuleError::Query {
        reason: "response has no data".to_string(),
    })
}

fn parse_sample((ts, raw): (f64, String)) -> Result<Sample> {
    let value = raw.parse::<f64>().map_err(|e| RuleError::Query {
        reason: format!("cannot parse sample value {raw:?}: {e}"),
    })?;
    Ok(Sample {
        value,
        timestamp: (ts * 1000.0).round() as i64,
    })
}

fn to_labels(metric: BTreeMap<String, String>) -> Vec<Label> {
    metric.into_iter().map(|(k, v)| Label::new(k, v)).collect()
}

impl PromData {
    fn into_vector(self) -> Result<Vec<Metric>> {
        if self.result_type != "vector" {
            return Err(RuleError::Query {
                reason: format!("unexpected result type {:?}, want vector", self.result_type),
            });
        }
        self.result
            .into_iter()
            .map(|s| {
                let raw = s.value.ok_or_else(|| RuleError::Query {
                    reason: "vector series without value".to_string(),
                })?;
                let sample = parse_sample(raw)?;
                Ok(Metric {
                    labels: to_labels(s.metric),
                    value: sample.value,
                    timestamp: sample.timestamp,
                })
            })
            .collect()
    }

    fn into_matrix(self) -> Result<Vec<RangeMetric>> {
        if self.result_type != "matrix" {
            return Err(RuleError::Query {
                reason: format!("unexpected result type {:?}, want matrix", self.result_type),
            });
        }
        self.result
            .into_iter()
            .map(|s| {
                let samples = s
                    .values
                    .into_iter()
                    .map(parse_sample)
                    .collect::<Result<Vec<_>>>()?;
                Ok(RangeMetric {
                    labels: to_labels(s.metric),
                    samples,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse_tests {
        use super::*;

        #[test]
        fn parses_vector() {
            let body = r#"{"status":"success","data":{"resultType":"vector","result":[
                {"metric":{"__name__":"up","job":"node"},"value":[1583786142.5,"1"]},
                {"metric":{"job":"api"},"value":[1583786142,"NaN"]}
            ]}}"#;
            let metrics = parse_response(body).unwrap().into_vector().unwrap();
            assert_eq!(metrics.len(), 2);
            assert_eq!(metrics[0].label("job"), Some("node"));
            assert_eq!(metrics[0].timestamp, 1_583_786_142_500);
            assert!((metrics[0].value - 1.0).abs() < f64::EPSILON);
            assert!(metrics[1].value.is_nan());
        }

        #[test]
        fn parses_matrix() {
            let body = r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{"job":"node"},"values":[[1,"1"],[2,"+Inf"]]}
            ]}}"#;
            let series = parse_response(body).unwrap().into_matrix().unwrap();
            assert_eq!(series[0].samples.len(), 2);
            assert_eq!(series[0].samples[1].timestamp, 2000);
            assert!(series[0].samples[1].value.is_infinite());
        }

        #[test]
        fn error_status_is_surfaced() {
            let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
            let err = parse_response(body).unwrap_err();
            assert!(err.to_string().contains("parse error"));
        }

        #[test]
        fn wrong_result_type() {
            let body = r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;
            assert!(parse_response(body).unwrap().into_vector().is_err());
        }

        #[test]
        fn bad_value() {
            let body = r#"{"status":"success","data":{"resultType":"vector","result":[
                {"metric":{},"value":[1,"abc"]}
            ]}}"#;
            assert!(parse_response(body).unwrap().into_vector().is_err());
        }

        #[test]
        fn formats_timestamp_with_millis() {
            let ts = DateTime::from_timestamp_millis(1_500_000_000_123).unwrap();
            assert_eq!(format_ts(ts), "1500000000.123");
        }
    }

    mod client_tests {
        use super::*;
        use axum::extract::Query;
        use axum::routing::get;
        use axum::{Json, Router};
        use std::collections::HashMap;

        async fn serve(app: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}")
        }

        #[tokio::test]
        async fn instant_query_roundtrip() {
            let app = Router::new().route(
                "/api/v1/query",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    let query = params.get("query").cloned().unwrap_or_default();
                    Json(serde_json::json!({
                        "status": "success",
                        "data": {
                            "resultType": "vector",
                            "result": [{"metric": {"query": query}, "value": [10, "3"]}]
                        }
                    }))
                }),
            );
            let url = serve(app).await;
            let client = PrometheusClient::new(PrometheusClientConfig::new(url)).unwrap();

            let metrics = client.query("up == 0", Utc::now()).await.unwrap();
            assert_eq!(metrics.len(), 1);
            assert_eq!(metrics[0].label("query"), Some("up == 0"));
            assert!((metrics[0].value - 3.0).abs() < f64::EPSILON);
        }

        #[tokio::test]
        async fn lookback_shifts_query_time() {
            let app = Router::new().route(
                "/api/v1/query",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    let time = params.get("time").cloned().unwrap_or_default();
                    Json(serde_json::json!({
                        "status": "success",
                        "data": {
                            "resultType": "vector",
                            "result": [{"metric": {"time": time}, "value": [10, "1"]}]
                        }
                    }))
                }),
            );
            let url = serve(app).await;
            let mut cfg = PrometheusClientConfig::new(url);
            cfg.lookback = Duration::from_secs(300);
            let client = PrometheusClient::new(cfg).unwrap();

            let ts = DateTime::from_timestamp(1_700_000_300, 0).unwrap();
            let metrics = client.query("up", ts).await.unwrap();
            let shifted = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
            assert_eq!(metrics[0].label("time"), Some(format_ts(shifted).as_str()));
        }

        #[tokio::test]
        async fn non_success_status_is_error() {
            let app = Router::new().route(
                "/api/v1/query",
                get(|| async { (axum::http::StatusCode::BAD_REQUEST, "bad query") }),
            );
            let url = serve(app).await;
            let client = PrometheusClient::new(PrometheusClientConfig::new(url)).unwrap();

            let err = client.query("up", Utc::now()).await.unwrap_err();
            assert!(matches!(err, RuleError::Query { .. }));
            assert!(err.to_string().contains("bad query"));
        }

        #[tokio::test]
        async fn range_query_rejects_inverted_range() {
            let client =
                PrometheusClient::new(PrometheusClientConfig::new("http://127.0.0.1:1")).unwrap();
            let now = Utc::now();
            let err = client
                .query_range("up", now, now - chrono::TimeDelta::seconds(10))
                .await
                .unwrap_err();
            assert!(matches!(err, RuleError::Query { .. }));
        }

        #[test]
        fn invalid_url_is_rejected() {
            assert!(PrometheusClient::new(PrometheusClientConfig::new("not a url")).is_err());
        }
    }
}
