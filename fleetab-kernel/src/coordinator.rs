/**
 * AGENT COORDINATOR - Protocole pull des agents (long-poll, status, heartbeat, métriques)
 *
 * RÔLE : Seul point d'entrée des agents. Le coordinator n'ouvre jamais de connexion
 * vers un agent : tout est initié côté agent.
 *
 * FONCTIONNEMENT :
 * - poll : ClaimNext bloquant sur le Notify par hôte du store (pas de re-poll serveur)
 * - report_status : vérifie le propriétaire, maintient ActivePipeline, réveille le controller
 * - heartbeat : upsert AgentRecord + miroir des rapports de pipelines
 * - ingest_metrics : push backend avec retry + cache borné
 * - boucle de reclaim : seul déclencheur de retry des tâches orphelines
 */

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::agents::{HeartbeatInfo, SharedAgentRegistry};
use crate::config::CoordinatorConf;
use crate::metrics::{with_retry, BackendError, MetricsBackend, RetryPolicy, SampleCache};
use crate::models::{
    ActivePipeline, MetricSample, PipelineKey, PipelineReport, PipelineStatus, ResourceSnapshot, Task, TaskStatus,
};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("metrics backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("invalid request: {0}")]
    Validation(String),
}

/// Rapport de statut d'une tâche (POST /agent/status/{task_id})
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub host_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub config_checksum: Option<String>,
    /// Échec non récupérable (rendu de config), aucun retry
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub host_id: String,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub resources: Option<ResourceSnapshot>,
    #[serde(default)]
    pub pipelines: Vec<PipelineReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub registered: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsBatch {
    pub host_id: String,
    pub samples: Vec<MetricSample>,
}

pub struct Coordinator {
    store: Arc<Store>,
    agents: SharedAgentRegistry,
    backend: Arc<dyn MetricsBackend>,
    cache: Arc<SampleCache>,
    conf: CoordinatorConf,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(
        store: Arc<Store>,
        agents: SharedAgentRegistry,
        backend: Arc<dyn MetricsBackend>,
        cache: Arc<SampleCache>,
        conf: CoordinatorConf,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, agents, backend, cache, conf, retry }
    }

    pub fn cache(&self) -> &SampleCache {
        &self.cache
    }

    /// Long-poll : 0..N tâches réclamées pour l'hôte
    pub async fn poll(&self, host_id: &str, capabilities: &[String], max: usize, wait: Duration) -> Vec<Task> {
        let max = max.clamp(1, self.conf.max_tasks_per_poll.max(1));
        let wait = wait.min(self.conf.max_wait());
        let tasks = self.store.tasks.claim_wait(host_id, capabilities, max, wait).await;
        if !tasks.is_empty() {
            debug!("[coordinator] delivered {} task(s) to {}", tasks.len(), host_id);
        }
        tasks
    }

    pub fn list_pending(&self, host_id: &str) -> Vec<Task> {
        self.store.tasks.list_pending(host_id)
    }

    pub fn report_status(&self, task_id: &str, report: StatusReport) -> Result<Task, CoordinatorError> {
        let now = OffsetDateTime::now_utc();
        let task = if report.permanent && report.status == TaskStatus::Failed {
            self.store.tasks.fail_permanently(task_id, &report.host_id, report.detail.clone(), now)?
        } else {
            self.store
                .tasks
                .update_status(task_id, Some(&report.host_id), report.status, report.detail.clone(), now)?
        };

        match task.status {
            TaskStatus::Succeeded => self.apply_success(&task, report.config_checksum, now),
            TaskStatus::Failed => warn!(
                "[coordinator] task {} ({:?}) failed on {}: {}",
                task.id,
                task.kind,
                task.host_id,
                task.detail.as_deref().unwrap_or("no detail")
            ),
            _ => {}
        }
        Ok(task)
    }

    fn apply_success(&self, task: &Task, checksum: Option<String>, now: OffsetDateTime) {
        let key = PipelineKey {
            host_id: task.host_id.clone(),
            experiment_id: task.experiment_id.clone(),
            variant: task.variant,
            role: task.kind.role(),
        };
        if task.kind.is_start() {
            // rapport rejoué : le pipeline est déjà connu
            if self.store.pipelines.get(&key).map(|p| p.start_task_id == task.id).unwrap_or(false) {
                return;
            }
            self.store.pipelines.upsert(ActivePipeline {
                host_id: task.host_id.clone(),
                experiment_id: task.experiment_id.clone(),
                variant: task.variant,
                role: task.kind.role(),
                start_task_id: task.id.clone(),
                config_checksum: checksum,
                status: PipelineStatus::Running,
                restarts: 0,
                updated_at: now,
            });
            info!("[coordinator] pipeline {:?}/{} active on {}", key.role, key.variant.as_str(), key.host_id);
        } else if task.kind.is_stop() {
            if self.store.pipelines.remove(&key).is_some() {
                info!("[coordinator] pipeline {:?}/{} stopped on {}", key.role, key.variant.as_str(), key.host_id);
            }
        } else {
            self.store.pipelines.modify(&key, |p| {
                p.config_checksum = checksum;
                p.status = PipelineStatus::Running;
                p.updated_at = now;
            });
        }
    }

    /// Upsert de l'agent + miroir des pipelines rapportés
    pub fn heartbeat(&self, hb: HeartbeatRequest) -> Result<HeartbeatResponse, CoordinatorError> {
        if hb.host_id.trim().is_empty() {
            return Err(CoordinatorError::Validation("host_id is required".into()));
        }
        let now = OffsetDateTime::now_utc();
        let mut failure_seen = false;

        for report in &hb.pipelines {
            let key = PipelineKey {
                host_id: hb.host_id.clone(),
                experiment_id: report.experiment_id.clone(),
                variant: report.variant,
                role: report.role,
            };
            let Some(current) = self.store.pipelines.get(&key) else { continue };
            if current.status == report.status && current.restarts == report.restarts {
                continue;
            }
            if report.status == PipelineStatus::Failed && current.status != PipelineStatus::Failed {
                warn!(
                    "[coordinator] pipeline {:?}/{} failed on {}: {}",
                    report.role,
                    report.variant.as_str(),
                    hb.host_id,
                    report.detail.as_deref().unwrap_or("no detail")
                );
                failure_seen = true;
            }
            self.store.pipelines.modify(&key, |p| {
                p.status = report.status;
                p.restarts = report.restarts;
                if report.config_checksum.is_some() {
                    p.config_checksum = report.config_checksum.clone();
                }
                p.updated_at = now;
            });
        }

        let registered = self.agents.record_heartbeat(
            HeartbeatInfo {
                host_id: hb.host_id,
                hostname: hb.hostname,
                capabilities: hb.capabilities,
                version: hb.version,
                os: hb.os,
                arch: hb.arch,
                resources: hb.resources,
                pipelines: hb.pipelines,
            },
            now,
        );

        if failure_seen {
            self.store.tasks.changes().notify_waiters();
        }
        Ok(HeartbeatResponse { registered, server_time: now })
    }

    /// Forward vers le backend puis cache. Les échantillons sont rattachés à l'hôte émetteur.
    pub async fn ingest_metrics(&self, batch: MetricsBatch) -> Result<usize, CoordinatorError> {
        let samples: Vec<MetricSample> = batch
            .samples
            .into_iter()
            .filter(|s| s.value.is_finite())
            .map(|mut s| {
                s.host_id = batch.host_id.clone();
                s
            })
            .collect();
        if samples.is_empty() {
            return Ok(0);
        }

        let backend = self.backend.clone();
        with_retry(self.retry, "push", || {
            let backend = backend.clone();
            let samples = &samples;
            async move { backend.push(samples).await }
        })
        .await?;

        self.cache.append(&samples);
        debug!("[coordinator] ingested {} samples from {}", samples.len(), batch.host_id);
        Ok(samples.len())
    }

    /// Une passe de reclaim ; retourne les tâches touchées
    pub fn reclaim_once(&self, now: OffsetDateTime) -> Vec<Task> {
        let threshold = Duration::from_secs(self.agents.policy().lost_after_secs);
        let agents = self.agents.clone();
        self.store.tasks.reclaim_stale(now, threshold, |host| agents.last_heartbeat(host))
    }

    pub fn spawn_reclaim_loop(coordinator: Arc<Coordinator>) -> tokio::task::JoinHandle<()> {
        let every = Duration::from_secs(coordinator.conf.reclaim_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let touched = coordinator.reclaim_once(OffsetDateTime::now_utc());
                if !touched.is_empty() {
                    info!("[coordinator] reclaim pass touched {} task(s)", touched.len());
                }
            }
        })
    }
}
