use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

use super::{sample_labels, BackendError, MetricsBackend, RangeQuery, Series, LABEL_HOST};
use crate::models::MetricSample;

/// Backend compatible Prometheus (query_range) avec import JSON-lines
pub struct PrometheusBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<MatrixEntry>,
}

#[derive(Debug, Deserialize)]
struct MatrixEntry {
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl PrometheusBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    fn escape(value: &str) -> String {
        value.replace('\\', "\\\\").replace('"', "\\\"")
    }

    fn escape_regex(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            if "\\.+*?()|[]{}^$".contains(c) {
                out.push('\\');
            }
            out.push(c);
        }
        Self::escape(&out)
    }

    /// `metric{k="v",host_id=~"a|b"}`
    pub fn selector(query: &RangeQuery) -> String {
        let mut matchers: Vec<String> = query
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", Self::escape(v)))
            .collect();
        if !query.hosts.is_empty() {
            let alternatives: Vec<String> = query.hosts.iter().map(|h| Self::escape_regex(h)).collect();
            matchers.push(format!("{LABEL_HOST}=~\"{}\"", alternatives.join("|")));
        }
        format!("{}{{{}}}", query.metric, matchers.join(","))
    }

    fn import_line(sample: &MetricSample) -> Result<String, BackendError> {
        let mut metric = sample_labels(sample);
        metric.insert("__name__".to_string(), sample.metric.clone());
        let timestamp_ms = sample.timestamp.unix_timestamp_nanos() / 1_000_000;
        serde_json::to_string(&serde_json::json!({
            "metric": metric,
            "values": [sample.value],
            "timestamps": [timestamp_ms as i64],
        }))
        .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

fn to_datetime(unix_secs: f64) -> Option<OffsetDateTime> {
    let nanos = (unix_secs * 1e9) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Series>, BackendError> {
        let selector = Self::selector(query);
        debug!("[metrics] query_range {}", selector);

        let start = query.start.unix_timestamp().to_string();
        let end = query.end.unix_timestamp().to_string();
        let step = format!("{}s", query.step_secs.max(1));
        let response = self
            .client
            .get(format!("{}/api/v1/query_range", self.base_url))
            .query(&[
                ("query", selector.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("step", step.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        if parsed.status != "success" {
            return Err(BackendError::Decode(parsed.error.unwrap_or_else(|| parsed.status.clone())));
        }

        let series = parsed
            .data
            .map(|d| d.result)
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let points = entry
                    .values
                    .into_iter()
                    .filter_map(|(ts, raw)| Some((to_datetime(ts)?, raw.parse::<f64>().ok()?)))
                    .collect();
                Series { labels: entry.metric, points }
            })
            .collect();
        Ok(series)
    }

    async fn push(&self, samples: &[MetricSample]) -> Result<(), BackendError> {
        if samples.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = samples.iter().map(Self::import_line).collect::<Result<_, _>>()?;
        let response = self
            .client
            .post(format!("{}/api/v1/import", self.base_url))
            .body(lines.join("\n"))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "prometheus"
    }
}
