//! API de gestion : expériences, agents, flux d'événements SSE.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{ApiError, AppState};
use crate::agents::AgentView;
use crate::models::{Experiment, MetricSample, NewExperiment, Task, Variant};

// POST /experiments
pub async fn create_experiment(
    State(app): State<AppState>,
    Json(request): Json<NewExperiment>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let experiment = app.controller.create(request)?;
    Ok((StatusCode::CREATED, Json(experiment)))
}

// GET /experiments
pub async fn list_experiments(State(app): State<AppState>) -> Json<Vec<Experiment>> {
    Json(app.controller.list())
}

// GET /experiments/{id}
pub async fn get_experiment(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(app.controller.get(&id)?))
}

// GET /experiments/{id}/tasks
pub async fn experiment_tasks(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Vec<Task>>, ApiError> {
    app.controller.get(&id)?;
    Ok(Json(app.store.tasks.for_experiment(&id)))
}

#[derive(Debug, Deserialize)]
pub struct SampleParams {
    #[serde(default)]
    metric: Option<String>,
    #[serde(default)]
    variant: Option<Variant>,
}

// GET /experiments/{id}/samples (cache récent, pas le backend)
pub async fn experiment_samples(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SampleParams>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    app.controller.get(&id)?;
    let samples = app.coordinator.cache().query(&id, params.metric.as_deref(), params.variant);
    Ok(Json(samples))
}

// POST /experiments/{id}/stop
pub async fn stop_experiment(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(app.controller.stop(&id)?))
}

// POST /experiments/{id}/promote
pub async fn promote_experiment(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(app.controller.promote(&id)?))
}

// POST /experiments/{id}/rollback
pub async fn rollback_experiment(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(app.controller.rollback(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct EventParams {
    #[serde(default)]
    experiment_id: Option<String>,
}

// GET /events (server-sent events, filtre optionnel par expérience)
pub async fn event_stream(
    State(app): State<AppState>,
    Query(params): Query<EventParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = app.events.subscribe();
    let closed = Box::pin(app.events.closed());
    let stream = stream::unfold((rx, params.experiment_id, closed), |(mut rx, filter, mut closed)| async move {
        loop {
            let received = tokio::select! {
                _ = &mut closed => return None,
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => {
                    if filter.as_deref().is_some_and(|id| id != event.experiment_id) {
                        continue;
                    }
                    let sse = Event::default()
                        .event("transition")
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().comment("unserializable event"));
                    return Some((Ok(sse), (rx, filter, closed)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[http] SSE subscriber lagging, {} event(s) skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// GET /agents
pub async fn list_agents(State(app): State<AppState>) -> Json<Vec<AgentView>> {
    Json(app.agents.list(OffsetDateTime::now_utc()))
}

// GET /agents/{id}
pub async fn get_agent(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<AgentView>, ApiError> {
    app.agents
        .view(&id, OffsetDateTime::now_utc())
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("agent {id} not found")))
}
