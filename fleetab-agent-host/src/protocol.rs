//! Wire messages of the kernel's agent protocol
//!
//! Mirrors only what the agent reads or writes:
//! - Tasks handed out by `GET /agent/tasks`
//! - Status reports (`POST /agent/status/{task_id}`)
//! - Heartbeats with resource snapshot and pipeline reports
//! - Metric sample batches (`POST /agent/metrics`)
//!
//! Unknown fields sent by the kernel are ignored, so the kernel can grow its
//! task records without breaking older agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRole {
    Collector,
    LoadSim,
}

impl PipelineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineRole::Collector => "collector",
            PipelineRole::LoadSim => "loadsim",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CollectorStart,
    CollectorUpdate,
    CollectorStop,
    LoadSimStart,
    LoadSimStop,
}

/// What a task asks the agent to do with its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Start,
    Update,
    Stop,
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

    pub fn action(&self) -> TaskAction {
        match self {
            TaskKind::CollectorStart | TaskKind::LoadSimStart => TaskAction::Start,
            TaskKind::CollectorUpdate => TaskAction::Update,
            TaskKind::CollectorStop | TaskKind::LoadSimStop => TaskAction::Stop,
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
    #[serde(default)]
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub experiment_id: String,
    pub host_id: String,
    pub variant: Variant,
    pub kind: TaskKind,
    #[serde(default)]
    pub payload: TaskPayload,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempt: u32,
}

impl Task {
    pub fn pipeline_key(&self) -> PipelineKey {
        PipelineKey {
            experiment_id: self.experiment_id.clone(),
            variant: self.variant,
            role: self.kind.role(),
        }
    }
}

/// Identity of a locally managed pipeline. Tasks sharing a key are applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey {
    pub experiment_id: String,
    pub variant: Variant,
    pub role: PipelineRole,
}

impl std::fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.experiment_id, self.variant.as_str(), self.role.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub host_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_checksum: Option<String>,
    #[serde(default)]
    pub permanent: bool,
}

impl StatusReport {
    pub fn running(host_id: &str) -> Self {
        Self { host_id: host_id.to_string(), status: TaskStatus::Running, detail: None, config_checksum: None, permanent: false }
    }

    pub fn succeeded(host_id: &str, detail: impl Into<String>, config_checksum: Option<String>) -> Self {
        Self {
            host_id: host_id.to_string(),
            status: TaskStatus::Succeeded,
            detail: Some(detail.into()),
            config_checksum,
            permanent: false,
        }
    }

    pub fn failed(host_id: &str, detail: impl Into<String>, permanent: bool) -> Self {
        Self {
            host_id: host_id.to_string(),
            status: TaskStatus::Failed,
            detail: Some(detail.into()),
            config_checksum: None,
            permanent,
        }
    }
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub task_id: String,
    pub experiment_id: String,
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
pub struct HeartbeatRequest {
    pub host_id: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub resources: Option<ResourceSnapshot>,
    pub pipelines: Vec<PipelineReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub registered: bool,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub experiment_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub variant: Variant,
    pub host_id: String,
    pub value: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsBatch {
    pub host_id: String,
    pub samples: Vec<MetricSample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_task_json_is_accepted() {
        // As serialized by the kernel, extra fields included
        let raw = r#"{
            "id": "t1", "experiment_id": "e1", "host_id": "h1", "variant": "candidate",
            "kind": "collector_update", "priority": 0, "status": "claimed", "attempt": 2,
            "max_attempts": 3, "seq": 7, "enqueued_at": "2026-01-01T00:00:00Z",
            "claimed_by": "h1", "claimed_at": "2026-01-01T00:00:01Z",
            "last_update": "2026-01-01T00:00:01Z", "detail": null, "permanent_failure": false,
            "payload": {"config_url": "file:///tmp/c.yaml", "overrides": {"batch": "512"},
                        "command": null, "self_metrics_url": "http://127.0.0.1:8888/metrics",
                        "metrics": ["datapoints_per_sec"]}
        }"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.kind.action(), TaskAction::Update);
        assert_eq!(task.payload.overrides["batch"], "512");
        assert_eq!(task.pipeline_key().to_string(), "e1/candidate/collector");
    }

    #[test]
    fn status_report_omits_empty_fields() {
        let json = serde_json::to_value(StatusReport::running("h1")).unwrap();
        assert_eq!(json, serde_json::json!({"host_id": "h1", "status": "running", "permanent": false}));

        let failed = serde_json::to_value(StatusReport::failed("h1", "bad template", true)).unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["permanent"], true);
    }
}
