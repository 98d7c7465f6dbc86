/**
 * FLEETAB KERNEL - Point d'entrée du plan de contrôle
 *
 * RÔLE : Orchestration de tous les modules : config, store, agents, controller,
 * coordinator, HTTP, bridge MQTT optionnel.
 *
 * ARCHITECTURE : Agents en pull (long-poll) + API REST + boucle d'évaluation du controller.
 * Le snapshot du store est écrit en tâche de fond et une dernière fois à l'arrêt.
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetab_kernel::agents::{AgentRegistry, LivenessPolicy, SharedAgentRegistry};
use fleetab_kernel::config::load_config;
use fleetab_kernel::controller::Controller;
use fleetab_kernel::coordinator::Coordinator;
use fleetab_kernel::events::EventBus;
use fleetab_kernel::health::HealthTracker;
use fleetab_kernel::http::{build_router, AppState};
use fleetab_kernel::metrics::{InMemoryBackend, MetricsBackend, PrometheusBackend, RetryPolicy, SampleCache};
use fleetab_kernel::mqtt;
use fleetab_kernel::store::Store;

const FLUSH_EVERY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetab_kernel=info")))
        .init();

    let config = Arc::new(load_config().await);
    if config.api_key.is_none() {
        warn!("[kernel] SECURITY: FLEETAB_API_KEY not set - every protected route will be refused");
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;

    // store durable
    let store = Arc::new(Store::open(&config.data_dir).await?);

    // agents
    let policy = LivenessPolicy {
        degraded_after_secs: config.coordinator.degraded_after_secs,
        lost_after_secs: config.coordinator.lost_after_secs,
    };
    let agents: SharedAgentRegistry = Arc::new(AgentRegistry::open(&config.data_dir, policy).await?);

    // backend de métriques
    let backend: Arc<dyn MetricsBackend> = match &config.metrics.backend_url {
        Some(url) => Arc::new(PrometheusBackend::new(
            url,
            Duration::from_secs(config.metrics.request_timeout_secs),
        )?),
        None => {
            warn!("[kernel] no metrics backend configured, samples kept in memory only");
            Arc::new(InMemoryBackend::new())
        }
    };
    let backend_name = backend.name();
    info!("[kernel] metrics backend: {}", backend_name);

    let events = EventBus::default();
    let health_tracker = HealthTracker::new();
    let retry = RetryPolicy { attempts: config.metrics.retry_attempts.max(1), ..RetryPolicy::default() };

    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        agents.clone(),
        backend.clone(),
        Arc::new(SampleCache::new(config.metrics.cache_capacity)),
        config.coordinator.clone(),
        retry,
    ));
    let controller = Arc::new(Controller::new(
        store.clone(),
        agents.clone(),
        backend,
        events.clone(),
        config.clone(),
    ));

    // tâches de fond
    Store::spawn_flusher(store.clone(), FLUSH_EVERY);
    AgentRegistry::start_monitoring(agents.clone(), Duration::from_secs(30));
    Coordinator::spawn_reclaim_loop(coordinator.clone());
    Controller::spawn_loop(controller.clone());

    if let Some(mqtt_conf) = config.mqtt.clone() {
        mqtt::spawn_mqtt_bridge(
            mqtt_conf,
            events.clone(),
            health_tracker.clone(),
            store.clone(),
            agents.clone(),
            backend_name,
        );
    }

    let app_state = AppState {
        store: store.clone(),
        agents: agents.clone(),
        controller,
        coordinator,
        events: events.clone(),
        health_tracker,
        metrics_backend: backend_name,
        api_key: config.api_key.clone(),
    };
    let app = build_router(app_state);

    let listener = TcpListener::bind(&config.listen).await?;
    info!("[kernel] listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("[kernel] cannot listen for shutdown signal: {}", e);
            }
            info!("[kernel] shutdown requested");
            // les flux SSE doivent se terminer pour que serve rende la main
            events.close();
        })
        .await?;

    // dernier snapshot
    if let Err(e) = store.flush().await {
        error!("[kernel] final snapshot failed: {}", e);
    }
    if let Err(e) = agents.save().await {
        error!("[kernel] failed to save agents: {}", e);
    }
    info!("[kernel] stopped");
    Ok(())
}
