//! Lecture de l'avancement d'un déploiement à partir de l'état persisté des tâches.
//! Aucun compteur volatile : deux lectures du même état donnent le même verdict.

use std::collections::{BTreeMap, HashMap};

use crate::models::{Experiment, HostId, Task, TaskKind, TaskStatus, Variant};

/// Étape suivante pour un couple (hôte, variante, type de tâche)
#[derive(Debug, Clone, PartialEq)]
pub enum StartStep {
    Missing,
    InFlight,
    Succeeded,
    Retry { next_attempt: u32 },
    Exhausted { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostOutcome {
    Succeeded,
    Failed(String),
    Unresolved,
}

#[derive(Debug, Default)]
pub struct DeployProgress {
    /// Tâches de démarrage à (re)créer : (hôte, variante, type, tentative)
    pub to_enqueue: Vec<(HostId, Variant, TaskKind, u32)>,
    pub hosts: BTreeMap<HostId, HostOutcome>,
}

impl DeployProgress {
    pub fn count(&self, wanted: &HostOutcome) -> usize {
        self.hosts
            .values()
            .filter(|o| std::mem::discriminant(*o) == std::mem::discriminant(wanted))
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(&HostOutcome::Succeeded)
    }

    pub fn unresolved_hosts(&self) -> Vec<HostId> {
        self.hosts
            .iter()
            .filter(|(_, o)| **o == HostOutcome::Unresolved)
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn failed_hosts(&self) -> Vec<(HostId, String)> {
        self.hosts
            .iter()
            .filter_map(|(h, o)| match o {
                HostOutcome::Failed(reason) => Some((h.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Nombre minimal d'hôtes pour une fraction de quorum (au moins 1)
pub fn quorum_count(total_hosts: usize, quorum: f64) -> usize {
    ((total_hosts as f64 * quorum) - 1e-9).ceil().max(1.0) as usize
}

pub fn start_kinds(experiment: &Experiment) -> Vec<TaskKind> {
    let mut kinds = vec![TaskKind::CollectorStart];
    if experiment.load_sim.is_some() {
        kinds.push(TaskKind::LoadSimStart);
    }
    kinds
}

fn step_for(latest: Option<&Task>) -> StartStep {
    let Some(task) = latest else { return StartStep::Missing };
    match task.status {
        TaskStatus::Pending | TaskStatus::Claimed | TaskStatus::Running => StartStep::InFlight,
        TaskStatus::Succeeded => StartStep::Succeeded,
        TaskStatus::Failed if task.is_retryable_failure() => StartStep::Retry { next_attempt: task.attempt + 1 },
        TaskStatus::Failed => StartStep::Exhausted {
            reason: format!(
                "{:?} failed after {} attempt(s): {}",
                task.kind,
                task.attempt,
                task.detail.as_deref().unwrap_or("no detail")
            ),
        },
        TaskStatus::Cancelled => StartStep::Exhausted { reason: format!("{:?} cancelled", task.kind) },
    }
}

pub fn deploy_progress(experiment: &Experiment, tasks: &[Task]) -> DeployProgress {
    let mut latest: HashMap<(&str, Variant, TaskKind), &Task> = HashMap::new();
    for task in tasks.iter().filter(|t| t.kind.is_start()) {
        let key = (task.host_id.as_str(), task.variant, task.kind);
        match latest.get(&key) {
            Some(existing) if existing.seq > task.seq => {}
            _ => {
                latest.insert(key, task);
            }
        }
    }

    let kinds = start_kinds(experiment);
    let mut progress = DeployProgress::default();
    for assignment in &experiment.targets {
        let host = &assignment.host_id;
        if let Some(reason) = experiment.excluded.get(host) {
            progress.hosts.insert(host.clone(), HostOutcome::Failed(reason.clone()));
            continue;
        }

        let mut outcome = HostOutcome::Succeeded;
        for kind in &kinds {
            let step = step_for(latest.get(&(host.as_str(), assignment.variant, *kind)).copied());
            match step {
                StartStep::Succeeded => {}
                StartStep::InFlight => {
                    if outcome == HostOutcome::Succeeded {
                        outcome = HostOutcome::Unresolved;
                    }
                }
                StartStep::Missing => {
                    progress.to_enqueue.push((host.clone(), assignment.variant, *kind, 1));
                    if outcome == HostOutcome::Succeeded {
                        outcome = HostOutcome::Unresolved;
                    }
                }
                StartStep::Retry { next_attempt } => {
                    progress.to_enqueue.push((host.clone(), assignment.variant, *kind, next_attempt));
                    if outcome == HostOutcome::Succeeded {
                        outcome = HostOutcome::Unresolved;
                    }
                }
                StartStep::Exhausted { reason } => {
                    outcome = HostOutcome::Failed(format!("{} {}", assignment.variant.as_str(), reason));
                }
            }
        }

        // un hôte Paired porte deux affectations : le pire verdict l'emporte
        let merged = match (progress.hosts.get(host), outcome) {
            (Some(HostOutcome::Failed(r)), _) => HostOutcome::Failed(r.clone()),
            (_, HostOutcome::Failed(r)) => HostOutcome::Failed(r),
            (Some(HostOutcome::Unresolved), _) | (_, HostOutcome::Unresolved) => HostOutcome::Unresolved,
            _ => HostOutcome::Succeeded,
        };
        progress.hosts.insert(host.clone(), merged);
    }

    // pas de nouvelle tentative pour un hôte déjà perdu
    let failed: Vec<HostId> = progress.failed_hosts().into_iter().map(|(h, _)| h).collect();
    progress.to_enqueue.retain(|(h, _, _, _)| !failed.contains(h));
    progress
}
