//! HTTP client for the kernel's agent protocol
//!
//! Every call is agent-initiated:
//! - `GET /agent/tasks` long-poll
//! - `POST /agent/status/{task_id}` with retry on transient errors
//! - `POST /agent/heartbeat`
//! - `POST /agent/metrics`

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{HeartbeatRequest, HeartbeatResponse, MetricsBatch, StatusReport, Task};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("coordinator answered {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ClientError {
    /// Worth retrying: network trouble, timeouts and 5xx / 429 answers
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(e) => !e.is_decode() && !e.is_builder(),
            ClientError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl CoordinatorClient {
    /// `timeout` bounds every call; the long-poll gets its wait on top
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shared HTTP client, reused for config fetch and metric scrapes
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ClientError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    /// Long-poll for up to `max` tasks, the kernel holds the request up to `wait`
    pub async fn poll_tasks(
        &self,
        host_id: &str,
        capabilities: &[String],
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Task>, ClientError> {
        let request = self
            .http
            .get(self.url("/agent/tasks"))
            .query(&[
                ("host_id", host_id.to_string()),
                ("capabilities", capabilities.join(",")),
                ("max", max.to_string()),
                ("wait_secs", wait.as_secs().to_string()),
            ])
            .timeout(wait + self.timeout);
        self.send(request).await
    }

    pub async fn heartbeat(&self, heartbeat: &HeartbeatRequest) -> Result<HeartbeatResponse, ClientError> {
        let request = self.http.post(self.url("/agent/heartbeat")).json(heartbeat).timeout(self.timeout);
        self.send(request).await
    }

    /// Returns how many samples the kernel accepted
    pub async fn push_metrics(&self, batch: &MetricsBatch) -> Result<usize, ClientError> {
        let request = self.http.post(self.url("/agent/metrics")).json(batch).timeout(self.timeout);
        let body: serde_json::Value = self.send(request).await?;
        Ok(body.get("accepted").and_then(|v| v.as_u64()).unwrap_or(0) as usize)
    }

    /// Report a task status, retrying transient failures with exponential backoff.
    /// Conflicts (task no longer ours, already terminal) are returned immediately.
    pub async fn report_status(&self, task_id: &str, report: &StatusReport) -> Result<(), ClientError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self
                .http
                .post(self.url(&format!("/agent/status/{task_id}")))
                .json(report)
                .timeout(self.timeout);
            match self.send::<serde_json::Value>(request).await {
                Ok(_) => {
                    debug!("Reported {:?} for task {}", report.status, task_id);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!("Status report for {} failed ({}), retrying in {:?}", task_id, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
