//! Prometheus text scrape of a pipeline's own metrics endpoint

use prometheus_parse::{Scrape, Value};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("cannot reach {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("cannot parse metrics from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedValue {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Scrape `url` and keep the scalar samples whose name is in `wanted`
pub async fn scrape(http: &reqwest::Client, url: &str, wanted: &[String]) -> Result<Vec<ScrapedValue>, ScrapeError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|source| ScrapeError::Fetch { url: url.to_string(), source })?;
    let status = response.status();
    if !status.is_success() {
        return Err(ScrapeError::Status { url: url.to_string(), status });
    }
    let body = response
        .text()
        .await
        .map_err(|source| ScrapeError::Fetch { url: url.to_string(), source })?;

    let values = parse(&body, wanted).map_err(|source| ScrapeError::Parse { url: url.to_string(), source })?;
    debug!("Scraped {} values from {}", values.len(), url);
    Ok(values)
}

/// Histograms and summaries are skipped, only counters, gauges and untyped values are kept
pub fn parse(body: &str, wanted: &[String]) -> std::io::Result<Vec<ScrapedValue>> {
    let lines = body.lines().map(|l| Ok(l.to_owned()));
    let scrape = Scrape::parse(lines)?;

    Ok(scrape
        .samples
        .into_iter()
        .filter(|s| wanted.iter().any(|w| *w == s.metric))
        .filter_map(|s| {
            let value = match s.value {
                Value::Counter(v) | Value::Gauge(v) | Value::Untyped(v) => v,
                _ => return None,
            };
            let labels = s.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            Some(ScrapedValue { metric: s.metric, labels, value })
        })
        .collect())
}
