use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::StoreError;
use crate::models::{Experiment, ExperimentId};

/// Relation Experiment avec écriture conditionnelle sur la version
pub struct ExperimentStore {
    experiments: RwLock<HashMap<ExperimentId, Experiment>>,
    dirty: Arc<AtomicBool>,
}

impl ExperimentStore {
    pub fn new(dirty: Arc<AtomicBool>) -> Self {
        Self { experiments: RwLock::new(HashMap::new()), dirty }
    }

    pub fn insert(&self, experiment: Experiment) -> Result<Experiment, StoreError> {
        let mut experiments = self.experiments.write();
        if experiments.contains_key(&experiment.id) {
            return Err(StoreError::Duplicate(experiment.id));
        }
        experiments.insert(experiment.id.clone(), experiment.clone());
        self.dirty.store(true, Ordering::Release);
        Ok(experiment)
    }

    pub fn get(&self, id: &str) -> Option<Experiment> {
        self.experiments.read().get(id).cloned()
    }

    /// Tri par date de création
    pub fn list(&self) -> Vec<Experiment> {
        let mut all: Vec<Experiment> = self.experiments.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Applique `apply` seulement si la version stockée vaut `expected_version`.
    /// La version est incrémentée à chaque écriture réussie.
    pub fn update_if<F>(&self, id: &str, expected_version: u64, apply: F) -> Result<Experiment, StoreError>
    where
        F: FnOnce(&mut Experiment),
    {
        let mut experiments = self.experiments.write();
        let current = experiments
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("experiment {id}")))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        apply(current);
        current.version = expected_version + 1;
        debug!("[store] experiment {} now at version {}", id, current.version);
        self.dirty.store(true, Ordering::Release);
        Ok(current.clone())
    }

    pub fn restore(&self, experiments: Vec<Experiment>) {
        let mut map = self.experiments.write();
        for experiment in experiments {
            map.insert(experiment.id.clone(), experiment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigRef, ExperimentDesign, ExperimentState, HostSelector, PhaseDurations};
    use std::collections::BTreeMap;
    use time::OffsetDateTime;

    pub(crate) fn sample_experiment(id: &str) -> Experiment {
        let now = OffsetDateTime::now_utc();
        Experiment {
            id: id.into(),
            name: "batching".into(),
            baseline: ConfigRef::default(),
            candidate: ConfigRef::default(),
            selector: HostSelector::Hosts { hosts: vec!["h1".into()] },
            design: ExperimentDesign::Split,
            load_sim: None,
            metrics: vec![],
            quorum: 0.5,
            alpha: 0.05,
            durations: PhaseDurations::default(),
            auto_decide: false,
            priority: 0,
            state: ExperimentState::Pending,
            targets: vec![],
            cohort: None,
            excluded: BTreeMap::new(),
            diagnostics: vec![],
            result: None,
            created_at: now,
            updated_at: now,
            deploying_since: None,
            running_since: None,
            analyzing_since: None,
            decided_at: None,
            version: 0,
        }
    }

    #[test]
    fn stale_version_is_rejected() {
        let store = ExperimentStore::new(Arc::new(AtomicBool::new(false)));
        store.insert(sample_experiment("e1")).unwrap();

        let updated = store
            .update_if("e1", 0, |e| e.state = ExperimentState::Deploying)
            .unwrap();
        assert_eq!(updated.version, 1);

        let err = store
            .update_if("e1", 0, |e| e.state = ExperimentState::Failed)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.get("e1").unwrap().state, ExperimentState::Deploying);
    }

    #[test]
    fn insert_rejects_existing_id() {
        let store = ExperimentStore::new(Arc::new(AtomicBool::new(false)));
        store.insert(sample_experiment("e1")).unwrap();
        assert!(matches!(store.insert(sample_experiment("e1")), Err(StoreError::Duplicate(_))));
        assert!(matches!(store.update_if("nope", 0, |_| {}), Err(StoreError::NotFound(_))));
    }
}
