/**
 * API REST FLEETAB - Serveur HTTP du plan de contrôle
 *
 * RÔLE :
 * Expose le protocole pull des agents (/agent/...) et l'API de gestion des
 * expériences (/experiments, /agents, /events, /system/health).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, état partagé unique (AppState)
 * - Middleware auth API key : header x-api-key obligatoire sauf /health
 * - Aucune clé configurée = toute route protégée refusée
 * - Erreurs métier converties en JSON { "error": ... } avec le code HTTP adapté
 */

mod agent;
mod experiments;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

use crate::agents::SharedAgentRegistry;
use crate::controller::{Controller, ControllerError};
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::events::EventBus;
use crate::health::{HealthTracker, KernelHealth};
use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub agents: SharedAgentRegistry,
    pub controller: Arc<Controller>,
    pub coordinator: Arc<Coordinator>,
    pub events: EventBus,
    pub health_tracker: HealthTracker,
    pub metrics_backend: &'static str,
    pub api_key: Option<String>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        // protocole agent
        .route("/agent/tasks", get(agent::poll_tasks))
        .route("/agent/tasks/pending", get(agent::pending_tasks))
        .route("/agent/status/{task_id}", post(agent::report_status))
        .route("/agent/heartbeat", post(agent::heartbeat))
        .route("/agent/metrics", post(agent::ingest_metrics))
        // gestion
        .route("/experiments", get(experiments::list_experiments).post(experiments::create_experiment))
        .route("/experiments/{id}", get(experiments::get_experiment))
        .route("/experiments/{id}/tasks", get(experiments::experiment_tasks))
        .route("/experiments/{id}/samples", get(experiments::experiment_samples))
        .route("/experiments/{id}/stop", post(experiments::stop_experiment))
        .route("/experiments/{id}/promote", post(experiments::promote_experiment))
        .route("/experiments/{id}/rollback", post(experiments::rollback_experiment))
        .route("/events", get(experiments::event_stream))
        .route("/agents", get(experiments::list_agents))
        .route("/agents/{id}", get(experiments::get_agent))
        .with_state(app_state.clone())
        .layer(middleware::from_fn_with_state(app_state, require_api_key))
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("[http] SECURITY: no API key configured, request to {} denied", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] unauthorized request to {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.store, &app.agents, app.metrics_backend))
}

/// Erreur HTTP : code + message sérialisé en `{ "error": ... }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, what)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Duplicate(_)
        | StoreError::InvalidTransition { .. }
        | StoreError::NotOwner { .. }
        | StoreError::Conflict { .. } => StatusCode::CONFLICT,
        StoreError::Io(_) | StoreError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(store_status(&e), e.to_string())
    }
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        let status = match &e {
            ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::Validation(_) | ControllerError::MissingCredential(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControllerError::InvalidState { .. } => StatusCode::CONFLICT,
            ControllerError::Store(inner) => store_status(inner),
        };
        Self::new(status, e.to_string())
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let status = match &e {
            CoordinatorError::Store(inner) => store_status(inner),
            CoordinatorError::Backend(_) => StatusCode::BAD_GATEWAY,
            CoordinatorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_http_codes() {
        let e: ApiError = ControllerError::NotFound("e1".into()).into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);

        let e: ApiError = ControllerError::MissingCredential("token".into()).into();
        assert_eq!(e.status, StatusCode::UNPROCESSABLE_ENTITY);

        let e: ApiError = CoordinatorError::Store(StoreError::NotOwner {
            task_id: "t1".into(),
            owner: Some("a".into()),
            reporter: "b".into(),
        })
        .into();
        assert_eq!(e.status, StatusCode::CONFLICT);

        let e: ApiError = StoreError::Conflict { id: "e1".into(), expected: 1, actual: 2 }.into();
        assert_eq!(e.status, StatusCode::CONFLICT);
    }
}
