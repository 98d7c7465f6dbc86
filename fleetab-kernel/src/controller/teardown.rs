use std::collections::BTreeSet;
use time::OffsetDateTime;
use tracing::{error, info};

use super::Controller;
use crate::models::{Experiment, ExperimentDesign, HostId, PipelineRole, Task, TaskKind, TaskPayload, TaskStatus, Variant};
use crate::store::StoreError;

type PipelineSlot = (HostId, Variant, PipelineRole);

impl Controller {
    /// Annule les tâches Pending et planifie un Stop pour tout pipeline démarré ou en cours
    /// de démarrage. `hosts` restreint l'opération à certains hôtes.
    pub(super) fn wind_down(&self, experiment: &Experiment, hosts: Option<&[HostId]>, now: OffsetDateTime) {
        let in_scope = |host: &str| hosts.map(|list| list.iter().any(|h| h == host)).unwrap_or(true);
        let mut to_stop: BTreeSet<PipelineSlot> = self.cancel_pending(experiment, &in_scope, now);

        for pipeline in self.store.pipelines.for_experiment(&experiment.id) {
            if in_scope(pipeline.host_id.as_str()) {
                to_stop.insert((pipeline.host_id, pipeline.variant, pipeline.role));
            }
        }

        for (host, variant, role) in &to_stop {
            self.enqueue_control(experiment, host, *variant, TaskKind::stop_for(*role), TaskPayload::default(), now);
        }
        if !to_stop.is_empty() {
            info!("[controller] {} pipeline stop(s) scheduled for {}", to_stop.len(), experiment.id);
        }
    }

    /// Tâches Pending -> Cancelled. Retourne les pipelines qu'une tâche start/update réclamée
    /// est en train de (re)lancer : ils devront être stoppés.
    fn cancel_pending(
        &self,
        experiment: &Experiment,
        in_scope: &dyn Fn(&str) -> bool,
        now: OffsetDateTime,
    ) -> BTreeSet<PipelineSlot> {
        let mut held = BTreeSet::new();
        let note_held = |task: &Task, set: &mut BTreeSet<PipelineSlot>| {
            if !task.kind.is_stop() && task.status.is_held() {
                set.insert((task.host_id.clone(), task.variant, task.kind.role()));
            }
        };

        for task in self.store.tasks.for_experiment(&experiment.id) {
            if !in_scope(task.host_id.as_str()) {
                continue;
            }
            if task.status != TaskStatus::Pending {
                note_held(&task, &mut held);
                continue;
            }
            match self.store.tasks.cancel(&task.id, "experiment winding down", now) {
                Ok(_) => {}
                // réclamée entre la lecture et l'annulation
                Err(StoreError::InvalidTransition { .. }) => {
                    if let Some(current) = self.store.tasks.get(&task.id) {
                        note_held(&current, &mut held);
                    }
                }
                Err(e) => error!("[controller] cannot cancel task {}: {}", task.id, e),
            }
        }
        held
    }

    /// Promotion : les collecteurs baseline passent sur la config candidate, le load-sim s'arrête.
    /// En design Paired, le collecteur candidate devient redondant et est stoppé.
    pub(super) fn teardown_promoted(&self, experiment: &Experiment, now: OffsetDateTime) {
        let always = |_: &str| true;
        let mut to_stop = self.cancel_pending(experiment, &always, now);
        let mut updates = 0;

        for pipeline in self.store.pipelines.for_experiment(&experiment.id) {
            match (pipeline.role, pipeline.variant) {
                (PipelineRole::Collector, Variant::Baseline) => {
                    let payload = self.payload_for(experiment, &pipeline.host_id, Variant::Candidate, &experiment.candidate);
                    self.enqueue_control(
                        experiment,
                        &pipeline.host_id,
                        Variant::Baseline,
                        TaskKind::CollectorUpdate,
                        payload,
                        now,
                    );
                    updates += 1;
                }
                (PipelineRole::Collector, Variant::Candidate) if experiment.design == ExperimentDesign::Paired => {
                    to_stop.insert((pipeline.host_id, pipeline.variant, pipeline.role));
                }
                (PipelineRole::Collector, Variant::Candidate) => {}
                (PipelineRole::LoadSim, _) => {
                    to_stop.insert((pipeline.host_id, pipeline.variant, pipeline.role));
                }
            }
        }

        for (host, variant, role) in &to_stop {
            self.enqueue_control(experiment, host, *variant, TaskKind::stop_for(*role), TaskPayload::default(), now);
        }
        info!(
            "[controller] promotion of {}: {} collector update(s), {} stop(s)",
            experiment.id,
            updates,
            to_stop.len()
        );
    }

    fn enqueue_control(
        &self,
        experiment: &Experiment,
        host: &str,
        variant: Variant,
        kind: TaskKind,
        payload: TaskPayload,
        now: OffsetDateTime,
    ) {
        if let Err(e) = self.enqueue(experiment, host, variant, kind, payload, 1, now) {
            error!("[controller] cannot enqueue {:?} for {} on {}: {}", kind, experiment.id, host, e);
        }
    }
}
