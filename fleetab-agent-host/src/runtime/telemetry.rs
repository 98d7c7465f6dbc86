//! Pipeline telemetry: scrape, label, batch

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::executor::PipelineView;
use crate::metrics::scrape;
use crate::metrics::ResourceSampler;
use crate::protocol::{MetricSample, MetricsBatch, PipelineKey};

pub const PROCESS_CPU_METRIC: &str = "fleetab_process_cpu_percent";
pub const PROCESS_MEMORY_METRIC: &str = "fleetab_process_memory_bytes";

fn sample(
    key: &PipelineKey,
    host_id: &str,
    at: DateTime<Utc>,
    metric: &str,
    value: f64,
    mut labels: BTreeMap<String, String>,
) -> MetricSample {
    labels.insert("role".to_string(), key.role.as_str().to_string());
    MetricSample {
        experiment_id: key.experiment_id.clone(),
        timestamp: at,
        metric: metric.to_string(),
        variant: key.variant,
        host_id: host_id.to_string(),
        value,
        labels,
    }
}

/// One round over every pipeline. Unreachable endpoints are skipped.
pub async fn collect(
    http: &reqwest::Client,
    sampler: &mut ResourceSampler,
    host_id: &str,
    pipelines: &[PipelineView],
) -> Vec<MetricSample> {
    let at = Utc::now();
    let mut samples = Vec::new();

    for view in pipelines {
        if let Some(url) = view.self_metrics_url.as_deref().filter(|_| !view.metrics.is_empty()) {
            match scrape::scrape(http, url, &view.metrics).await {
                Ok(values) => samples.extend(
                    values
                        .into_iter()
                        .map(|v| sample(&view.key, host_id, at, &v.metric, v.value, v.labels)),
                ),
                Err(e) => warn!("Scrape of {} failed: {}", view.key, e),
            }
        }

        if let Some(usage) = view.pid.and_then(|pid| sampler.process_usage(pid)) {
            samples.push(sample(&view.key, host_id, at, PROCESS_CPU_METRIC, usage.cpu_percent as f64, BTreeMap::new()));
            samples.push(sample(&view.key, host_id, at, PROCESS_MEMORY_METRIC, usage.memory_bytes as f64, BTreeMap::new()));
        }
    }
    debug!("Collected {} samples from {} pipelines", samples.len(), pipelines.len());
    samples
}

pub fn batches(host_id: &str, samples: Vec<MetricSample>, batch_size: usize) -> Vec<MetricsBatch> {
    samples
        .chunks(batch_size.max(1))
        .map(|chunk| MetricsBatch { host_id: host_id.to_string(), samples: chunk.to_vec() })
        .collect()
}
