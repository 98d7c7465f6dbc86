use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::models::{ActivePipeline, PipelineKey};

/// Pipelines actifs par (hôte, expérience, variante, rôle)
pub struct PipelineStore {
    pipelines: RwLock<BTreeMap<PipelineKey, ActivePipeline>>,
    dirty: Arc<AtomicBool>,
}

impl PipelineStore {
    pub fn new(dirty: Arc<AtomicBool>) -> Self {
        Self { pipelines: RwLock::new(BTreeMap::new()), dirty }
    }

    pub fn upsert(&self, pipeline: ActivePipeline) {
        self.pipelines.write().insert(pipeline.key(), pipeline);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn remove(&self, key: &PipelineKey) -> Option<ActivePipeline> {
        let removed = self.pipelines.write().remove(key);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    pub fn get(&self, key: &PipelineKey) -> Option<ActivePipeline> {
        self.pipelines.read().get(key).cloned()
    }

    /// Met à jour un pipeline existant, sans effet s'il est inconnu
    pub fn modify<F: FnOnce(&mut ActivePipeline)>(&self, key: &PipelineKey, apply: F) -> bool {
        let mut pipelines = self.pipelines.write();
        match pipelines.get_mut(key) {
            Some(pipeline) => {
                apply(pipeline);
                self.dirty.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn for_experiment(&self, experiment_id: &str) -> Vec<ActivePipeline> {
        self.pipelines
            .read()
            .values()
            .filter(|p| p.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    pub fn for_host(&self, host_id: &str) -> Vec<ActivePipeline> {
        self.pipelines
            .read()
            .values()
            .filter(|p| p.host_id == host_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ActivePipeline> {
        self.pipelines.read().values().cloned().collect()
    }

    pub fn restore(&self, pipelines: Vec<ActivePipeline>) {
        let mut map = self.pipelines.write();
        for pipeline in pipelines {
            map.insert(pipeline.key(), pipeline);
        }
    }
}
