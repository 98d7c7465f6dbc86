/**
 * MODÈLES - Relations durables du plan de contrôle
 *
 * RÔLE : Experiment, Task, AgentRecord, ActivePipeline (durables) + MetricSample (cache).
 * Toutes les structures voyagent en JSON (API REST, snapshot disque, protocole agent).
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::analysis::AnalysisOutcome;

pub type ExperimentId = String;
pub type TaskId = String;
pub type HostId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::Candidate => "candidate",
        }
    }

    pub fn all() -> [Variant; 2] {
        [Variant::Baseline, Variant::Candidate]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Pending,
    Deploying,
    Running,
    Analyzing,
    Succeeded,
    Failed,
    Promoted,
    RolledBack,
}

impl ExperimentState {
    /// États encore pilotés par la boucle d'évaluation
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExperimentState::Pending
                | ExperimentState::Deploying
                | ExperimentState::Running
                | ExperimentState::Analyzing
        )
    }

    /// Plus aucune transition possible
    pub fn is_final(&self) -> bool {
        matches!(self, ExperimentState::Promoted | ExperimentState::RolledBack)
    }
}

/// Split : hôtes répartis en deux cohortes. Paired : chaque hôte exécute les deux variantes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentDesign {
    #[default]
    Split,
    Paired,
}

/// Référence de configuration : template à récupérer + overrides clé/valeur
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigRef {
    pub config_url: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    /// Ligne de commande du processus, `{config}` = chemin du fichier rendu
    #[serde(default)]
    pub command: Option<String>,
    /// Endpoint Prometheus exposé par le processus lui-même
    #[serde(default)]
    pub self_metrics_url: Option<String>,
    #[serde(default)]
    pub required_credentials: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostSelector {
    Hosts {
        hosts: Vec<HostId>,
    },
    Query {
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        hostname_prefix: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDirection {
    #[default]
    LowerIsBetter,
    HigherIsBetter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGoal {
    pub name: String,
    #[serde(default)]
    pub direction: MetricDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub deploy_timeout_secs: u64,
    pub observation_window_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            deploy_timeout_secs: 600,
            observation_window_secs: 3600,
            grace_period_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAssignment {
    pub host_id: HostId,
    pub variant: Variant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    pub baseline: Vec<HostId>,
    pub candidate: Vec<HostId>,
}

impl Cohort {
    pub fn hosts(&self, variant: Variant) -> &[HostId] {
        match variant {
            Variant::Baseline => &self.baseline,
            Variant::Candidate => &self.candidate,
        }
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.baseline.iter().chain(self.candidate.iter()).any(|h| h == host_id)
    }

    pub fn remove_host(&mut self, host_id: &str) {
        self.baseline.retain(|h| h != host_id);
        self.candidate.retain(|h| h != host_id);
    }

    /// Nombre d'hôtes distincts dans la cohorte
    pub fn host_count(&self) -> usize {
        let mut all: Vec<&HostId> = self.baseline.iter().chain(self.candidate.iter()).collect();
        all.sort();
        all.dedup();
        all.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(default)]
    pub host_id: Option<HostId>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Rollback,
    NoChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub metric: String,
    pub direction: MetricDirection,
    pub outcome: AnalysisOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub recommendation: Recommendation,
    pub usable: bool,
    pub alpha: f64,
    pub metrics: Vec<MetricResult>,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
}

/// Requête de création d'expérience (API de gestion)
#[derive(Debug, Clone, Deserialize)]
pub struct NewExperiment {
    pub name: String,
    pub baseline: ConfigRef,
    pub candidate: ConfigRef,
    pub selector: HostSelector,
    #[serde(default)]
    pub design: ExperimentDesign,
    #[serde(default)]
    pub load_sim: Option<ConfigRef>,
    #[serde(default)]
    pub metrics: Vec<MetricGoal>,
    #[serde(default)]
    pub quorum: Option<f64>,
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub durations: Option<PhaseDurations>,
    #[serde(default)]
    pub auto_decide: bool,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub baseline: ConfigRef,
    pub candidate: ConfigRef,
    pub selector: HostSelector,
    pub design: ExperimentDesign,
    #[serde(default)]
    pub load_sim: Option<ConfigRef>,
    pub metrics: Vec<MetricGoal>,
    pub quorum: f64,
    pub alpha: f64,
    pub durations: PhaseDurations,
    pub auto_decide: bool,
    pub priority: i32,
    pub state: ExperimentState,
    #[serde(default)]
    pub targets: Vec<HostAssignment>,
    #[serde(default)]
    pub cohort: Option<Cohort>,
    #[serde(default)]
    pub excluded: BTreeMap<HostId, String>,
    #[serde(default)]
    pub diagnostics: Vec<DiagnosticEntry>,
    #[serde(default)]
    pub result: Option<ResultSummary>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deploying_since: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub running_since: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub analyzing_since: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    /// Compteur optimiste, incrémenté à chaque écriture
    #[serde(default)]
    pub version: u64,
}

impl Experiment {
    pub fn config_for(&self, variant: Variant) -> &ConfigRef {
        match variant {
            Variant::Baseline => &self.baseline,
            Variant::Candidate => &self.candidate,
        }
    }

    pub fn diagnose(&mut self, at: OffsetDateTime, host_id: Option<&str>, message: impl Into<String>) {
        self.diagnostics.push(DiagnosticEntry {
            at,
            host_id: host_id.map(str::to_string),
            message: message.into(),
        });
    }

    /// Exclusion définitive d'un hôte (cohorte + analyse), tracée une seule fois
    pub fn exclude_host(&mut self, at: OffsetDateTime, host_id: &str, reason: impl Into<String>) -> bool {
        if self.excluded.contains_key(host_id) {
            return false;
        }
        let reason = reason.into();
        self.excluded.insert(host_id.to_string(), reason.clone());
        if let Some(cohort) = self.cohort.as_mut() {
            cohort.remove_host(host_id);
        }
        self.diagnose(at, Some(host_id), format!("host excluded: {reason}"));
        true
    }

    pub fn target_hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.targets.iter().map(|t| t.host_id.clone()).collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRole {
    Collector,
    LoadSim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CollectorStart,
    CollectorUpdate,
    CollectorStop,
    LoadSimStart,
    LoadSimStop,
}

impl TaskKind {
    pub fn role(&self) -> PipelineRole {
        match self {
            TaskKind::CollectorStart | TaskKind::CollectorUpdate | TaskKind::CollectorStop => {
                PipelineRole::Collector
            }
            TaskKind::LoadSimStart | TaskKind::LoadSimStop => PipelineRole::LoadSim,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, TaskKind::CollectorStart | TaskKind::LoadSimStart)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, TaskKind::CollectorStop | TaskKind::LoadSimStop)
    }

    pub fn stop_for(role: PipelineRole) -> TaskKind {
        match role {
            PipelineRole::Collector => TaskKind::CollectorStop,
            PipelineRole::LoadSim => TaskKind::LoadSimStop,
        }
    }

    /// Capacité que l'agent doit déclarer pour réclamer ce type de tâche
    pub fn required_capability(&self) -> &'static str {
        match self.role() {
            PipelineRole::Collector => "collector",
            PipelineRole::LoadSim => "loadsim",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn is_held(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub config_url: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub self_metrics_url: Option<String>,
    /// Noms de métriques à remonter pour l'analyse
    #[serde(default)]
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub experiment_id: ExperimentId,
    pub host_id: HostId,
    pub variant: Variant,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub priority: i32,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    #[serde(default)]
    pub claimed_by: Option<HostId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    #[serde(default)]
    pub detail: Option<String>,
    /// Échec sans retry possible (rendu de config, payload invalide)
    #[serde(default)]
    pub permanent_failure: bool,
}

/// Contrainte d'unicité des tâches non terminales
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub experiment_id: ExperimentId,
    pub host_id: HostId,
    pub variant: Variant,
    pub kind: TaskKind,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            experiment_id: self.experiment_id.clone(),
            host_id: self.host_id.clone(),
            variant: self.variant,
            kind: self.kind,
        }
    }

    pub fn attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Échec que le controller peut re-enqueue
    pub fn is_retryable_failure(&self) -> bool {
        self.status == TaskStatus::Failed && !self.permanent_failure && self.attempts_left()
    }
}

/// Brouillon de tâche avant insertion dans le store
#[derive(Debug, Clone)]
pub struct NewTask {
    pub experiment_id: ExperimentId,
    pub host_id: HostId,
    pub variant: Variant,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub priority: i32,
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Healthy,
    Degraded,
    Lost,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    #[serde(default)]
    pub load_avg: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Failed,
    Stopped,
}

/// Etat d'un pipeline tel que rapporté par l'agent dans son heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub task_id: TaskId,
    pub experiment_id: ExperimentId,
    pub variant: Variant,
    pub role: PipelineRole,
    pub status: PipelineStatus,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub config_checksum: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub host_id: HostId,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(default)]
    pub resources: Option<ResourceSnapshot>,
    #[serde(default)]
    pub pipelines: Vec<PipelineReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineKey {
    pub host_id: HostId,
    pub experiment_id: ExperimentId,
    pub variant: Variant,
    pub role: PipelineRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePipeline {
    pub host_id: HostId,
    pub experiment_id: ExperimentId,
    pub variant: Variant,
    pub role: PipelineRole,
    pub start_task_id: TaskId,
    #[serde(default)]
    pub config_checksum: Option<String>,
    pub status: PipelineStatus,
    #[serde(default)]
    pub restarts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ActivePipeline {
    pub fn key(&self) -> PipelineKey {
        PipelineKey {
            host_id: self.host_id.clone(),
            experiment_id: self.experiment_id.clone(),
            variant: self.variant,
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub experiment_id: ExperimentId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub metric: String,
    pub variant: Variant,
    pub host_id: HostId,
    pub value: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}
