#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use fleetab_agent_host::config::AgentConfig;
use fleetab_agent_host::discovery::Identity;
use fleetab_agent_host::metrics::ResourceSampler;
use fleetab_agent_host::protocol::{PipelineStatus, Task};
use fleetab_agent_host::runtime::{Dispatcher, Runtime};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn kernel() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex("^/agent/status/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent/heartbeat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"registered": true, "server_time": "2026-01-01T00:00:00Z"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accepted": 0})))
        .mount(&server)
        .await;
    server
}

fn config(server: &MockServer, work_dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.coordinator.url = server.uri();
    config.coordinator.api_key = Some("k".into());
    config.coordinator.poll_wait_secs = 1;
    config.coordinator.heartbeat_interval_secs = 1;
    config.agent.host_id = "host-01".into();
    config.agent.capabilities = Some(vec!["collector".into(), "loadsim".into()]);
    config.supervisor.startup_grace_ms = 100;
    config.supervisor.restart_backoff_ms = 10;
    config.supervisor.stop_timeout_ms = 1_000;
    config.supervisor.work_dir = work_dir.to_path_buf();
    config.telemetry.scrape_interval_secs = 1;
    config
}

fn runtime(config: AgentConfig) -> Runtime {
    let identity = Identity::discover(&config);
    Runtime::new(config, identity).unwrap()
}

fn task(id: &str, kind: &str, payload: Value) -> Task {
    serde_json::from_value(json!({
        "id": id,
        "experiment_id": "exp-1",
        "host_id": "host-01",
        "variant": "baseline",
        "kind": kind,
        "status": "claimed",
        "attempt": 1,
        "payload": payload
    }))
    .unwrap()
}

fn template(dir: &Path, body: &str) -> String {
    let file = dir.join("template.yaml");
    std::fs::write(&file, body).unwrap();
    format!("file://{}", file.display())
}

async fn statuses(server: &MockServer, task_id: &str) -> Vec<Value> {
    let target = format!("/agent/status/{task_id}");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == target)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

async fn wait_for_statuses(server: &MockServer, task_id: &str, count: usize) -> Vec<Value> {
    for _ in 0..100 {
        let seen = statuses(server, task_id).await;
        if seen.len() >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task {task_id} never reached {count} status reports");
}

#[tokio::test]
async fn start_then_stop_a_collector() {
    let server = kernel().await;
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(config(&server, &dir.path().join("work")));
    let url = template(dir.path(), "interval: ${interval}\nhost: ${host_id}\n");

    let start = task(
        "t-start",
        "collector_start",
        json!({"config_url": url, "overrides": {"interval": "10s", "host_id": "host-01"}, "command": "sleep 30"}),
    );
    runtime.executor().execute(start).await;

    let reports = statuses(&server, "t-start").await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["status"], "running");
    assert_eq!(reports[1]["status"], "succeeded");
    let checksum = reports[1]["config_checksum"].as_str().unwrap().to_string();
    assert!(checksum.starts_with("sha256:"));

    let rendered = dir.path().join("work").join("exp-1").join("baseline-collector.conf");
    assert_eq!(std::fs::read_to_string(&rendered).unwrap(), "interval: 10s\nhost: host-01\n");

    let pipelines = runtime.executor().reports().await;
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0].status, PipelineStatus::Running);
    assert_eq!(pipelines[0].task_id, "t-start");
    assert_eq!(pipelines[0].config_checksum.as_deref(), Some(checksum.as_str()));

    let response = runtime.heartbeat_once(&mut ResourceSampler::new()).await.unwrap();
    assert!(response.registered);

    runtime.executor().execute(task("t-stop", "collector_stop", json!({}))).await;
    let reports = statuses(&server, "t-stop").await;
    assert_eq!(reports[1]["status"], "succeeded");
    assert!(runtime.executor().reports().await.is_empty());
    assert!(!rendered.exists());
}

#[tokio::test]
async fn render_failure_is_permanent_and_spawns_nothing() {
    let server = kernel().await;
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(config(&server, dir.path()));
    let url = template(dir.path(), "exporter: ${missing_key}\n");

    let start = task("t-bad", "collector_start", json!({"config_url": url, "command": "sleep 30"}));
    runtime.executor().execute(start).await;

    let reports = statuses(&server, "t-bad").await;
    assert_eq!(reports[1]["status"], "failed");
    assert_eq!(reports[1]["permanent"], true);
    assert!(reports[1]["detail"].as_str().unwrap().contains("missing_key"));
    assert!(runtime.executor().reports().await.is_empty());
}

#[tokio::test]
async fn unsupported_config_scheme_is_permanent() {
    let server = kernel().await;
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(config(&server, dir.path()));

    let start = task(
        "t-ftp",
        "collector_start",
        json!({"config_url": "ftp://configs.internal/base.yaml", "command": "sleep 30"}),
    );
    runtime.executor().execute(start).await;

    let reports = statuses(&server, "t-ftp").await;
    assert_eq!(reports[1]["status"], "failed");
    assert_eq!(reports[1]["permanent"], true);
    assert!(runtime.executor().reports().await.is_empty());
}

#[tokio::test]
async fn stop_of_unknown_pipeline_succeeds() {
    let server = kernel().await;
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(config(&server, dir.path()));

    runtime.executor().execute(task("t-stop", "load_sim_stop", json!({}))).await;
    let reports = statuses(&server, "t-stop").await;
    assert_eq!(reports[1]["status"], "succeeded");
    assert_eq!(reports[1]["detail"], "not running");
}

#[tokio::test]
async fn crash_looping_pipeline_is_reported_failed() {
    let server = kernel().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&server, dir.path());
    config.supervisor.max_restarts = 1;
    let runtime = runtime(config);
    let url = template(dir.path(), "ok\n");

    let start = task("t-flaky", "collector_start", json!({"config_url": url, "command": "sleep 0.3"}));
    runtime.executor().execute(start).await;
    assert_eq!(statuses(&server, "t-flaky").await[1]["status"], "succeeded");

    let mut failed = None;
    for _ in 0..60 {
        let reports = runtime.executor().reports().await;
        if reports[0].status == PipelineStatus::Failed {
            failed = Some(reports[0].clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let failed = failed.expect("pipeline never reported failed");
    assert_eq!(failed.restarts, 1);
    assert!(failed.detail.unwrap().contains("restart budget"));
}

#[tokio::test]
async fn redelivered_tasks_are_dispatched_once() {
    let server = kernel().await;
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(config(&server, dir.path()));
    let mut dispatcher = Dispatcher::new(runtime.executor().clone());

    let stop = task("t-1", "collector_stop", json!({}));
    assert!(dispatcher.dispatch(stop.clone()));
    assert!(!dispatcher.dispatch(stop.clone()));

    // reclaimed then claimed again: new attempt, executed again
    let mut again = stop;
    again.attempt = 2;
    assert!(dispatcher.dispatch(again));
    assert_eq!(dispatcher.worker_count(), 1);

    let reports = wait_for_statuses(&server, "t-1", 4).await;
    assert_eq!(reports.len(), 4);

    tokio::time::sleep(Duration::from_millis(50)).await;
    dispatcher.release_idle(&[]);
    assert_eq!(dispatcher.worker_count(), 0);
}

#[tokio::test]
async fn poll_loop_runs_tasks_until_shutdown() {
    let server = kernel().await;
    let dir = tempfile::tempdir().unwrap();
    let url = template(dir.path(), "batch: ${batch}\n");

    Mock::given(method("GET"))
        .and(path("/agent/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "t-loop", "experiment_id": "exp-1", "host_id": "host-01", "variant": "candidate",
            "kind": "collector_start", "status": "claimed", "attempt": 1,
            "payload": {"config_url": url, "overrides": {"batch": "512"}, "command": "sleep 30"}
        }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/agent/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let runtime = runtime(config(&server, &dir.path().join("work")));
    runtime
        .run(async {
            wait_for_statuses(&server, "t-loop", 2).await;
            // let a heartbeat carry the new pipeline
            tokio::time::sleep(Duration::from_millis(1_200)).await;
        })
        .await
        .unwrap();

    let reports = statuses(&server, "t-loop").await;
    assert_eq!(reports[1]["status"], "succeeded");

    let requests = server.received_requests().await.unwrap();
    let polls: Vec<_> = requests.iter().filter(|r| r.url.path() == "/agent/tasks").collect();
    assert!(polls[0].url.query().unwrap().contains("host_id=host-01"));
    assert!(polls[0].headers.get("x-api-key").is_some());

    let heartbeats: Vec<Value> = requests
        .iter()
        .filter(|r| r.url.path() == "/agent/heartbeat")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert!(heartbeats.iter().any(|hb| hb["pipelines"]
        .as_array()
        .map(|p| p.iter().any(|p| p["task_id"] == "t-loop" && p["status"] == "running"))
        .unwrap_or(false)));
    assert!(heartbeats.iter().all(|hb| hb["host_id"] == "host-01"));
}
