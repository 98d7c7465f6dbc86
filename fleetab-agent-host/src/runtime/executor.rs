//! Task execution against the locally managed pipelines
//!
//! A task is acknowledged (`running`), applied, then reported `succeeded` or
//! `failed`. Render and payload errors are reported as permanent failures so
//! the kernel never retries them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::client::CoordinatorClient;
use crate::config::CommandsConfig;
use crate::protocol::{PipelineKey, PipelineReport, PipelineRole, StatusReport, Task, TaskAction};
use crate::render::{self, RenderError, RenderedConfig};
use crate::supervisor::{self, FailureNotice, ProcessHandle, ProcessSpec, SupervisorConfig, SupervisorError};

struct Pipeline {
    task_id: String,
    handle: Arc<ProcessHandle>,
    config_path: PathBuf,
    config_checksum: Option<String>,
    self_metrics_url: Option<String>,
    metrics: Vec<String>,
}

/// What telemetry needs to know about a running pipeline
#[derive(Debug, Clone)]
pub struct PipelineView {
    pub key: PipelineKey,
    pub pid: Option<u32>,
    pub self_metrics_url: Option<String>,
    pub metrics: Vec<String>,
}

#[derive(Debug)]
struct Done {
    detail: String,
    checksum: Option<String>,
}

#[derive(Debug)]
struct Failure {
    detail: String,
    permanent: bool,
}

impl Failure {
    fn permanent(detail: impl Into<String>) -> Self {
        Self { detail: detail.into(), permanent: true }
    }

    fn transient(detail: impl Into<String>) -> Self {
        Self { detail: detail.into(), permanent: false }
    }
}

impl From<RenderError> for Failure {
    fn from(e: RenderError) -> Self {
        // A template that does not render never will; fetch and disk errors may clear up
        let permanent = !matches!(e, RenderError::Fetch { .. } | RenderError::Io(_));
        Self { detail: format!("config render failed: {e}"), permanent }
    }
}

impl From<SupervisorError> for Failure {
    fn from(e: SupervisorError) -> Self {
        Self::transient(e.to_string())
    }
}

pub struct Executor {
    host_id: String,
    client: CoordinatorClient,
    supervisor: SupervisorConfig,
    work_dir: PathBuf,
    commands: CommandsConfig,
    failures: mpsc::UnboundedSender<FailureNotice>,
    pipelines: Mutex<HashMap<PipelineKey, Pipeline>>,
}

impl Executor {
    pub fn new(
        host_id: String,
        client: CoordinatorClient,
        supervisor: SupervisorConfig,
        work_dir: PathBuf,
        commands: CommandsConfig,
        failures: mpsc::UnboundedSender<FailureNotice>,
    ) -> Self {
        Self {
            host_id,
            client,
            supervisor,
            work_dir,
            commands,
            failures,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Acknowledge, apply and report one task
    pub async fn execute(&self, task: Task) {
        let key = task.pipeline_key();
        info!("Task {} ({:?}, attempt {}) for {}", task.id, task.kind, task.attempt, key);

        if let Err(e) = self.client.report_status(&task.id, &StatusReport::running(&self.host_id)).await {
            if !e.is_transient() {
                warn!("Task {} refused by the coordinator ({}), skipping", task.id, e);
                return;
            }
            warn!("Could not acknowledge task {}: {}", task.id, e);
        }

        let outcome = match task.kind.action() {
            TaskAction::Start => self.start(&task, &key).await,
            TaskAction::Update => self.update(&task, &key).await,
            TaskAction::Stop => self.stop(&key).await,
        };

        let report = match outcome {
            Ok(done) => {
                info!("Task {} succeeded: {}", task.id, done.detail);
                StatusReport::succeeded(&self.host_id, done.detail, done.checksum)
            }
            Err(failure) => {
                warn!("Task {} failed (permanent: {}): {}", task.id, failure.permanent, failure.detail);
                StatusReport::failed(&self.host_id, failure.detail, failure.permanent)
            }
        };
        if let Err(e) = self.client.report_status(&task.id, &report).await {
            error!("Could not report outcome of task {}: {}", task.id, e);
        }
    }

    async fn start(&self, task: &Task, key: &PipelineKey) -> Result<Done, Failure> {
        let existing = self.pipelines.lock().await.remove(key);
        if let Some(existing) = existing {
            info!("Replacing running pipeline {} (start task {})", key, existing.task_id);
            existing.handle.stop().await?;
        }

        let rendered = self.render(task, key).await?;
        let spec = self.process_spec(task, key, &rendered.path)?;
        let handle = supervisor::start(key.to_string(), spec, self.supervisor, self.failures.clone()).await?;
        let pid = handle.pid();

        self.pipelines.lock().await.insert(
            key.clone(),
            Pipeline {
                task_id: task.id.clone(),
                handle: Arc::new(handle),
                config_path: rendered.path,
                config_checksum: Some(rendered.checksum.clone()),
                self_metrics_url: task.payload.self_metrics_url.clone(),
                metrics: task.payload.metrics.clone(),
            },
        );
        Ok(Done { detail: format!("started (pid {})", display_pid(pid)), checksum: Some(rendered.checksum) })
    }

    async fn update(&self, task: &Task, key: &PipelineKey) -> Result<Done, Failure> {
        let handle = match self.pipelines.lock().await.get(key) {
            Some(pipeline) => pipeline.handle.clone(),
            None => return Err(Failure::transient(format!("no pipeline {key} to update"))),
        };

        let rendered = self.render(task, key).await?;
        let spec = self.process_spec(task, key, &rendered.path)?;
        handle.update(spec).await?;

        if let Some(pipeline) = self.pipelines.lock().await.get_mut(key) {
            pipeline.config_path = rendered.path;
            pipeline.config_checksum = Some(rendered.checksum.clone());
            if task.payload.self_metrics_url.is_some() {
                pipeline.self_metrics_url = task.payload.self_metrics_url.clone();
            }
            if !task.payload.metrics.is_empty() {
                pipeline.metrics = task.payload.metrics.clone();
            }
        }
        Ok(Done { detail: format!("updated (pid {})", display_pid(handle.pid())), checksum: Some(rendered.checksum) })
    }

    async fn stop(&self, key: &PipelineKey) -> Result<Done, Failure> {
        let Some(pipeline) = self.pipelines.lock().await.remove(key) else {
            return Ok(Done { detail: "not running".to_string(), checksum: None });
        };

        if let Err(e) = pipeline.handle.stop().await {
            let failure = Failure::from(e);
            self.pipelines.lock().await.insert(key.clone(), pipeline);
            return Err(failure);
        }
        if let Err(e) = tokio::fs::remove_file(&pipeline.config_path).await {
            debug!("Could not remove {}: {}", pipeline.config_path.display(), e);
        }
        Ok(Done { detail: "stopped".to_string(), checksum: pipeline.config_checksum })
    }

    async fn render(&self, task: &Task, key: &PipelineKey) -> Result<RenderedConfig, Failure> {
        let url = task
            .payload
            .config_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Failure::permanent("payload has no config_url"))?;
        Ok(render::materialize(self.client.http(), url, &task.payload.overrides, &self.work_dir, key).await?)
    }

    fn process_spec(&self, task: &Task, key: &PipelineKey, config_path: &Path) -> Result<ProcessSpec, Failure> {
        let template = match &task.payload.command {
            Some(command) => command.clone(),
            None => match key.role {
                PipelineRole::Collector => self.commands.collector.clone(),
                PipelineRole::LoadSim => self.commands.load_sim.clone(),
            },
        };
        if template.trim().is_empty() {
            return Err(Failure::permanent(format!("no command configured for {}", key.role.as_str())));
        }

        let config = config_path.display().to_string();
        let command = template.replace("{config}", &shell_quote(&config));
        let env = vec![
            ("FLEETAB_HOST_ID".to_string(), self.host_id.clone()),
            ("FLEETAB_EXPERIMENT_ID".to_string(), key.experiment_id.clone()),
            ("FLEETAB_VARIANT".to_string(), key.variant.as_str().to_string()),
            ("FLEETAB_ROLE".to_string(), key.role.as_str().to_string()),
            ("FLEETAB_CONFIG".to_string(), config),
        ];
        Ok(ProcessSpec { command, env, work_dir: config_path.parent().map(Path::to_path_buf) })
    }

    /// Pipeline reports for the next heartbeat
    pub async fn reports(&self) -> Vec<PipelineReport> {
        let pipelines = self.pipelines.lock().await;
        let mut reports: Vec<PipelineReport> = pipelines
            .iter()
            .map(|(key, pipeline)| {
                let snapshot = pipeline.handle.snapshot();
                PipelineReport {
                    task_id: pipeline.task_id.clone(),
                    experiment_id: key.experiment_id.clone(),
                    variant: key.variant,
                    role: key.role,
                    status: snapshot.state.pipeline_status(),
                    restarts: snapshot.restarts,
                    config_checksum: pipeline.config_checksum.clone(),
                    detail: snapshot.state.failure().map(str::to_string),
                }
            })
            .collect();
        reports.sort_by(|a, b| (&a.experiment_id, a.variant, a.role).cmp(&(&b.experiment_id, b.variant, b.role)));
        reports
    }

    pub async fn views(&self) -> Vec<PipelineView> {
        self.pipelines
            .lock()
            .await
            .iter()
            .map(|(key, pipeline)| PipelineView {
                key: key.clone(),
                pid: pipeline.handle.pid(),
                self_metrics_url: pipeline.self_metrics_url.clone(),
                metrics: pipeline.metrics.clone(),
            })
            .collect()
    }

    pub async fn keys(&self) -> Vec<PipelineKey> {
        self.pipelines.lock().await.keys().cloned().collect()
    }

    /// Agent shutdown: stop every process, nothing is reported
    pub async fn stop_all(&self) {
        let pipelines: Vec<(PipelineKey, Pipeline)> = self.pipelines.lock().await.drain().collect();
        let stops = pipelines.iter().map(|(key, pipeline)| async move {
            if let Err(e) = pipeline.handle.stop().await {
                warn!("Could not stop {} on shutdown: {}", key, e);
            }
        });
        futures::future::join_all(stops).await;
    }
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
}

fn shell_quote(value: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("\"{value}\"")
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
