use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::models::{MetricSample, Variant};

/// Cache FIFO borné des derniers échantillons poussés (lectures dashboard)
pub struct SampleCache {
    capacity: usize,
    samples: Mutex<VecDeque<MetricSample>>,
}

impl SampleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Ajoute en fin de file, évince les plus anciens au-delà de la capacité
    pub fn append(&self, batch: &[MetricSample]) {
        let mut samples = self.samples.lock();
        for sample in batch {
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back(sample.clone());
        }
    }

    pub fn query(&self, experiment_id: &str, metric: Option<&str>, variant: Option<Variant>) -> Vec<MetricSample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.experiment_id == experiment_id)
            .filter(|s| metric.map(|m| s.metric == m).unwrap_or(true))
            .filter(|s| variant.map(|v| s.variant == v).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use time::OffsetDateTime;

    fn sample(value: f64, variant: Variant) -> MetricSample {
        MetricSample {
            experiment_id: "e1".into(),
            timestamp: OffsetDateTime::now_utc(),
            metric: "cpu".into(),
            variant,
            host_id: "h1".into(),
            value,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn oldest_samples_are_evicted_first() {
        let cache = SampleCache::new(3);
        cache.append(&[
            sample(1.0, Variant::Baseline),
            sample(2.0, Variant::Candidate),
            sample(3.0, Variant::Baseline),
            sample(4.0, Variant::Baseline),
        ]);
        assert_eq!(cache.len(), 3);

        let values: Vec<f64> = cache.query("e1", None, None).iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);

        let baseline = cache.query("e1", Some("cpu"), Some(Variant::Baseline));
        assert_eq!(baseline.len(), 2);
        assert!(cache.query("e2", None, None).is_empty());
    }
}
