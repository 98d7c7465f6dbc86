//! Routes du protocole agent. Toutes initiées par l'agent.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::time::Duration;

use super::{ApiError, AppState};
use crate::coordinator::{HeartbeatRequest, HeartbeatResponse, MetricsBatch, StatusReport};
use crate::models::Task;

#[derive(Debug, Deserialize)]
pub struct PollParams {
    host_id: String,
    /// Liste séparée par des virgules
    #[serde(default)]
    capabilities: Option<String>,
    #[serde(default)]
    max: Option<usize>,
    /// Absent = attente maximale autorisée par le kernel
    #[serde(default)]
    wait_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HostParams {
    host_id: String,
}

fn split_capabilities(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

// GET /agent/tasks (long-poll)
pub async fn poll_tasks(
    State(app): State<AppState>,
    Query(params): Query<PollParams>,
) -> Result<Json<Vec<Task>>, ApiError> {
    if params.host_id.trim().is_empty() {
        return Err(ApiError::unprocessable("host_id is required"));
    }
    let capabilities = split_capabilities(params.capabilities.as_deref());
    let wait = Duration::from_secs(params.wait_secs.unwrap_or(u64::MAX));
    let tasks = app
        .coordinator
        .poll(&params.host_id, &capabilities, params.max.unwrap_or(usize::MAX), wait)
        .await;
    Ok(Json(tasks))
}

// GET /agent/tasks/pending (diagnostic)
pub async fn pending_tasks(State(app): State<AppState>, Query(params): Query<HostParams>) -> Json<Vec<Task>> {
    Json(app.coordinator.list_pending(&params.host_id))
}

// POST /agent/status/{task_id}
pub async fn report_status(
    State(app): State<AppState>,
    Path(task_id): Path<String>,
    Json(report): Json<StatusReport>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(app.coordinator.report_status(&task_id, report)?))
}

// POST /agent/heartbeat
pub async fn heartbeat(
    State(app): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    Ok(Json(app.coordinator.heartbeat(request)?))
}

// POST /agent/metrics
pub async fn ingest_metrics(
    State(app): State<AppState>,
    Json(batch): Json<MetricsBatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accepted = app.coordinator.ingest_metrics(batch).await?;
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_are_split_and_trimmed() {
        assert_eq!(split_capabilities(Some("collector, loadsim,,")), vec!["collector", "loadsim"]);
        assert!(split_capabilities(None).is_empty());
    }
}
