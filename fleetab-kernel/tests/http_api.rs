use std::sync::Arc;
use std::time::Duration;

use fleetab_kernel::agents::AgentRegistry;
use fleetab_kernel::config::KernelConfig;
use fleetab_kernel::controller::Controller;
use fleetab_kernel::coordinator::Coordinator;
use fleetab_kernel::events::EventBus;
use fleetab_kernel::health::HealthTracker;
use fleetab_kernel::http::{build_router, AppState};
use fleetab_kernel::metrics::{InMemoryBackend, RetryPolicy, SampleCache};
use fleetab_kernel::store::Store;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const KEY: &str = "test-key";

struct Server {
    base: String,
    state: AppState,
    backend: Arc<InMemoryBackend>,
}

fn app_state(api_key: Option<&str>) -> (AppState, Arc<InMemoryBackend>) {
    let config = Arc::new(KernelConfig::default());
    let store = Arc::new(Store::in_memory());
    let agents = Arc::new(AgentRegistry::new(Default::default()));
    let backend = Arc::new(InMemoryBackend::new());
    let events = EventBus::default();
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        agents.clone(),
        backend.clone(),
        Arc::new(SampleCache::new(100)),
        config.coordinator.clone(),
        RetryPolicy::default(),
    ));
    let controller = Arc::new(Controller::new(store.clone(), agents.clone(), backend.clone(), events.clone(), config));
    let state = AppState {
        store,
        agents,
        controller,
        coordinator,
        events,
        health_tracker: HealthTracker::new(),
        metrics_backend: "memory",
        api_key: api_key.map(str::to_string),
    };
    (state, backend)
}

async fn start(api_key: Option<&str>) -> Server {
    let (state, backend) = app_state(api_key);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server { base: format!("http://{addr}"), state, backend }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().timeout(Duration::from_secs(10)).build().unwrap()
}

fn experiment_body(hosts: &[&str]) -> Value {
    json!({
        "name": "batch-size",
        "baseline": {"config_url": "file:///etc/otel/baseline.yaml"},
        "candidate": {"config_url": "file:///etc/otel/candidate.yaml"},
        "selector": {"type": "hosts", "hosts": hosts},
        "metrics": [{"name": "cpu_seconds", "direction": "lower_is_better"}]
    })
}

async fn heartbeat(server: &Server, host: &str) -> Value {
    client()
        .post(format!("{}/agent/heartbeat", server.base))
        .header("x-api-key", KEY)
        .json(&json!({
            "host_id": host,
            "hostname": format!("{host}.lan"),
            "capabilities": ["collector"],
            "version": "0.1.0"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn auth_is_enforced_except_on_health() {
    let server = start(Some(KEY)).await;
    let http = client();

    let health = http.get(format!("{}/health", server.base)).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let missing = http.get(format!("{}/experiments", server.base)).send().await.unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = http
        .get(format!("{}/experiments", server.base))
        .header("x-api-key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let ok = http
        .get(format!("{}/system/health", server.base))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    let body: Value = ok.json().await.unwrap();
    assert_eq!(body["metrics_backend"], "memory");
}

#[tokio::test]
async fn no_configured_key_refuses_everything_protected() {
    let server = start(None).await;
    let response = client()
        .get(format!("{}/agents", server.base))
        .header("x-api-key", "")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let health = client().get(format!("{}/health", server.base)).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn experiment_lifecycle_over_http() {
    let server = start(Some(KEY)).await;
    let http = client();

    let first = heartbeat(&server, "host-a").await;
    assert_eq!(first["registered"], true);
    heartbeat(&server, "host-b").await;

    // validation
    let invalid = http
        .post(format!("{}/experiments", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"name": "", "baseline": {"config_url": "x"}, "candidate": {"config_url": "y"},
                      "selector": {"type": "hosts", "hosts": ["host-a"]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 422);
    let error: Value = invalid.json().await.unwrap();
    assert!(error["error"].as_str().unwrap().contains("name"));

    let created = http
        .post(format!("{}/experiments", server.base))
        .header("x-api-key", KEY)
        .json(&experiment_body(&["host-a", "host-b"]))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let experiment: Value = created.json().await.unwrap();
    let id = experiment["id"].as_str().unwrap().to_string();
    assert_eq!(experiment["state"], "pending");

    server.state.controller.evaluate(&id).await.unwrap();

    // long-poll de host-a
    let tasks: Vec<Value> = http
        .get(format!("{}/agent/tasks", server.base))
        .query(&[("host_id", "host-a"), ("capabilities", "collector"), ("wait_secs", "1")])
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    let task_id = tasks[0]["id"].as_str().unwrap().to_string();
    assert_eq!(tasks[0]["status"], "claimed");
    assert_eq!(tasks[0]["payload"]["overrides"]["host_id"], "host-a");

    // mauvais propriétaire
    let foreign = http
        .post(format!("{}/agent/status/{}", server.base, task_id))
        .header("x-api-key", KEY)
        .json(&json!({"host_id": "host-b", "status": "succeeded"}))
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 409);

    let done = http
        .post(format!("{}/agent/status/{}", server.base, task_id))
        .header("x-api-key", KEY)
        .json(&json!({"host_id": "host-a", "status": "succeeded", "config_checksum": "sha256:00"}))
        .send()
        .await
        .unwrap();
    assert_eq!(done.status(), 200);

    let pending: Vec<Value> = http
        .get(format!("{}/agent/tasks/pending", server.base))
        .query(&[("host_id", "host-b")])
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    // métriques
    let accepted: Value = http
        .post(format!("{}/agent/metrics", server.base))
        .header("x-api-key", KEY)
        .json(&json!({
            "host_id": "host-a",
            "samples": [{
                "experiment_id": id,
                "timestamp": "2026-01-01T00:00:00Z",
                "metric": "cpu_seconds",
                "variant": "baseline",
                "host_id": "spoofed",
                "value": 1.5
            }]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accepted["accepted"], 1);
    assert_eq!(server.backend.len(), 1);

    let samples: Vec<Value> = http
        .get(format!("{}/experiments/{}/samples", server.base, id))
        .query(&[("variant", "baseline")])
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0]["host_id"], "host-a");

    let listed: Vec<Value> = http
        .get(format!("{}/experiments/{}/tasks", server.base, id))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);

    // arrêt opérateur
    let stopped: Value = http
        .post(format!("{}/experiments/{}/stop", server.base, id))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stopped["state"], "failed");

    let again = http
        .post(format!("{}/experiments/{}/stop", server.base, id))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 409);

    let missing = http
        .get(format!("{}/experiments/unknown", server.base))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn agents_are_listed_with_liveness() {
    let server = start(Some(KEY)).await;
    heartbeat(&server, "host-a").await;

    let agents: Vec<Value> = client()
        .get(format!("{}/agents", server.base))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["host_id"], "host-a");
    assert_eq!(agents[0]["liveness"], "healthy");

    let unknown = client()
        .get(format!("{}/agents/host-z", server.base))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);
}

#[tokio::test]
async fn transitions_are_streamed_as_server_sent_events() {
    let server = start(Some(KEY)).await;
    let mut stream = client()
        .get(format!("{}/events", server.base))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);

    let created = server
        .state
        .controller
        .create(serde_json::from_value(experiment_body(&["host-a", "host-b"])).unwrap())
        .unwrap();

    let mut received = String::new();
    while !received.contains(&created.id) {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.chunk())
            .await
            .expect("no event within 5s")
            .unwrap()
            .expect("stream closed");
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(received.contains("event: transition"));
    assert!(received.contains("\"to\":\"pending\""));
}

#[tokio::test]
async fn open_event_stream_does_not_block_graceful_shutdown() {
    let (state, _) = app_state(Some(KEY));
    let events = state.events.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, build_router(state))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
                events.close();
            })
            .await
    });

    let mut stream = reqwest::Client::new()
        .get(format!("http://{addr}/events"))
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server still waiting on the event stream")
        .unwrap()
        .unwrap();

    // le flux se termine proprement côté client
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = stream.chunk().await {}
    })
    .await;
    assert!(end.is_ok());
}
