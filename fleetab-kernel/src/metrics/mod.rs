/**
 * METRICS BACKEND - Frontière avec la base de séries temporelles externe
 *
 * RÔLE : Requêtes range (analyse) et push d'échantillons (ingestion agents).
 * Le kernel ne stocke rien d'autoritatif : seul un cache borné garde les derniers points.
 *
 * FONCTIONNEMENT :
 * - Trait MetricsBackend (Prometheus-compatible ou mémoire)
 * - Erreurs transitoires (transport, 5xx) retentées avec backoff exponentiel
 * - Les erreurs de décodage ne sont jamais retentées
 */

mod cache;
mod memory;
mod prometheus;

pub use cache::SampleCache;
pub use memory::InMemoryBackend;
pub use prometheus::PrometheusBackend;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use crate::models::MetricSample;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transport(_) => true,
            BackendError::Status { status, .. } => *status >= 500 || *status == 429,
            BackendError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

/// Sélecteur : nom de métrique, égalités de labels, hôtes autorisés, fenêtre
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    /// Vide = tous les hôtes
    pub hosts: Vec<String>,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub step_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(OffsetDateTime, f64)>,
}

pub const LABEL_EXPERIMENT: &str = "experiment_id";
pub const LABEL_VARIANT: &str = "variant";
pub const LABEL_HOST: &str = "host_id";

#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Series>, BackendError>;

    async fn push(&self, samples: &[MetricSample]) -> Result<(), BackendError>;

    fn name(&self) -> &'static str;
}

/// Labels complets d'un échantillon, identifiants d'expérience inclus
pub fn sample_labels(sample: &MetricSample) -> BTreeMap<String, String> {
    let mut labels = sample.labels.clone();
    labels.insert(LABEL_EXPERIMENT.to_string(), sample.experiment_id.clone());
    labels.insert(LABEL_VARIANT.to_string(), sample.variant.as_str().to_string());
    labels.insert(LABEL_HOST.to_string(), sample.host_id.clone());
    labels
}

/// Séquence ordonnée dans le temps, toutes séries confondues
pub fn flatten_series(series: Vec<Series>) -> Vec<f64> {
    let mut points: Vec<(OffsetDateTime, f64)> = series.into_iter().flat_map(|s| s.points).collect();
    points.sort_by(|a, b| a.0.cmp(&b.0));
    points.into_iter().map(|(_, v)| v).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!("[metrics] {} failed ({}), retry {}/{} in {:?}", what, e, attempt, policy.attempts, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
