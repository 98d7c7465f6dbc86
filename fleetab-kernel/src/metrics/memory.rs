use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{sample_labels, BackendError, MetricsBackend, RangeQuery, Series, LABEL_HOST};
use crate::models::MetricSample;

/// Backend en mémoire pour le développement local et les tests
#[derive(Default)]
pub struct InMemoryBackend {
    samples: RwLock<Vec<MetricSample>>,
    unavailable: RwLock<bool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simule une panne du backend (erreurs de transport)
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if *self.unavailable.read() {
            return Err(BackendError::Transport("in-memory backend marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsBackend for InMemoryBackend {
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Series>, BackendError> {
        self.check_available()?;
        let mut grouped: BTreeMap<BTreeMap<String, String>, Vec<_>> = BTreeMap::new();
        for sample in self.samples.read().iter() {
            if sample.metric != query.metric || sample.timestamp < query.start || sample.timestamp > query.end {
                continue;
            }
            let labels = sample_labels(sample);
            let matches = query.labels.iter().all(|(k, v)| labels.get(k) == Some(v));
            let host_allowed = query.hosts.is_empty()
                || labels.get(LABEL_HOST).map(|h| query.hosts.contains(h)).unwrap_or(false);
            if matches && host_allowed {
                grouped.entry(labels).or_default().push((sample.timestamp, sample.value));
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(labels, mut points)| {
                points.sort_by(|a, b| a.0.cmp(&b.0));
                Series { labels, points }
            })
            .collect())
    }

    async fn push(&self, samples: &[MetricSample]) -> Result<(), BackendError> {
        self.check_available()?;
        self.samples.write().extend_from_slice(samples);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Variant;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn query_filters_by_labels_hosts_and_window() {
        let backend = InMemoryBackend::new();
        let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let sample = |host: &str, variant: Variant, offset: i64, value: f64| MetricSample {
            experiment_id: "e1".into(),
            timestamp: t0 + time::Duration::seconds(offset),
            metric: "cpu".into(),
            variant,
            host_id: host.into(),
            value,
            labels: BTreeMap::new(),
        };
        backend
            .push(&[
                sample("h1", Variant::Baseline, 10, 1.0),
                sample("h1", Variant::Baseline, 5, 2.0),
                sample("h2", Variant::Baseline, 5, 3.0),
                sample("h1", Variant::Candidate, 5, 4.0),
                sample("h1", Variant::Baseline, 900, 5.0),
            ])
            .await
            .unwrap();

        let mut labels = BTreeMap::new();
        labels.insert("variant".to_string(), "baseline".to_string());
        let query = RangeQuery {
            metric: "cpu".into(),
            labels,
            hosts: vec!["h1".into()],
            start: t0,
            end: t0 + time::Duration::seconds(600),
            step_secs: 15,
        };
        let series = backend.query_range(&query).await.unwrap();
        assert_eq!(super::super::flatten_series(series), vec![2.0, 1.0]);

        backend.set_unavailable(true);
        assert!(backend.query_range(&query).await.unwrap_err().is_transient());
    }
}
