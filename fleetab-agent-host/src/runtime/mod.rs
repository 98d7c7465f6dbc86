//! Agent runtime: the pull loop between this host and the kernel
//!
//! Three concurrent loops share one executor:
//! - Heartbeat every interval, plus an immediate one when a pipeline fails
//! - Long-poll for tasks, each routed to a per-pipeline worker queue so that
//!   start / update / stop of one pipeline apply in order while different
//!   pipelines proceed independently
//! - Telemetry scrape and push
//!
//! The runtime never changes anything on its own: every process it starts or
//! stops comes from a task.

mod executor;
pub mod telemetry;

pub use executor::{Executor, PipelineView};

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::CoordinatorClient;
use crate::config::AgentConfig;
use crate::discovery::Identity;
use crate::metrics::ResourceSampler;
use crate::protocol::{HeartbeatRequest, HeartbeatResponse, PipelineKey, Task};
use crate::supervisor::{FailureNotice, SupervisorConfig};

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);
const SEEN_TASKS: usize = 4096;

pub struct Runtime {
    identity: Identity,
    config: AgentConfig,
    client: CoordinatorClient,
    executor: Arc<Executor>,
    failures: mpsc::UnboundedReceiver<FailureNotice>,
}

impl Runtime {
    pub fn new(config: AgentConfig, identity: Identity) -> Result<Self> {
        let client = CoordinatorClient::new(
            &config.coordinator.url,
            config.coordinator.api_key.clone(),
            config.coordinator.request_timeout(),
        )
        .context("Failed to build coordinator client")?;

        let (failures_tx, failures) = mpsc::unbounded_channel();
        let executor = Arc::new(Executor::new(
            identity.host_id.clone(),
            client.clone(),
            SupervisorConfig::from(&config.supervisor),
            config.supervisor.work_dir.clone(),
            config.commands.clone(),
            failures_tx,
        ));

        Ok(Self { identity, config, client, executor, failures })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Run until `shutdown` resolves, then stop every managed process
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.supervisor.work_dir)
            .await
            .with_context(|| format!("Failed to create work dir {}", self.config.supervisor.work_dir.display()))?;
        info!(
            "Agent {} polling {} with capabilities {:?}",
            self.identity.host_id, self.config.coordinator.url, self.identity.capabilities
        );

        let Runtime { identity, config, client, executor, failures } = self;
        let agent = Agent { identity, config, client, executor: executor.clone() };

        tokio::select! {
            _ = agent.heartbeat_loop(failures) => {}
            _ = agent.poll_loop() => {}
            _ = agent.telemetry_loop() => {}
            _ = shutdown => info!("Shutdown requested"),
        }

        executor.stop_all().await;
        info!("Agent stopped");
        Ok(())
    }

    /// Send one heartbeat with the current resource snapshot and pipeline reports
    pub async fn heartbeat_once(&self, sampler: &mut ResourceSampler) -> Result<HeartbeatResponse> {
        let agent = Agent {
            identity: self.identity.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
            executor: self.executor.clone(),
        };
        agent.heartbeat(sampler).await
    }
}

struct Agent {
    identity: Identity,
    config: AgentConfig,
    client: CoordinatorClient,
    executor: Arc<Executor>,
}

impl Agent {
    async fn heartbeat(&self, sampler: &mut ResourceSampler) -> Result<HeartbeatResponse> {
        let request = HeartbeatRequest {
            host_id: self.identity.host_id.clone(),
            hostname: self.identity.hostname.clone(),
            capabilities: self.identity.capabilities.clone(),
            version: self.identity.version.clone(),
            os: self.identity.os.clone(),
            arch: self.identity.arch.clone(),
            resources: Some(sampler.snapshot()),
            pipelines: self.executor.reports().await,
        };
        let response = self.client.heartbeat(&request).await.context("Heartbeat failed")?;
        debug!("Heartbeat sent ({} pipelines, registered: {})", request.pipelines.len(), response.registered);
        Ok(response)
    }

    async fn heartbeat_loop(&self, mut failures: mpsc::UnboundedReceiver<FailureNotice>) {
        let mut sampler = ResourceSampler::new();
        let mut ticker = interval(self.config.coordinator.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some((name, reason)) = failures.recv() => {
                    warn!("Pipeline {} failed ({}), sending immediate heartbeat", name, reason);
                }
            }
            if let Err(e) = self.heartbeat(&mut sampler).await {
                warn!("{:#}", e);
            }
        }
    }

    async fn poll_loop(&self) {
        let mut dispatcher = Dispatcher::new(self.executor.clone());
        let mut backoff = Duration::from_secs(1);
        let coordinator = &self.config.coordinator;

        loop {
            match self
                .client
                .poll_tasks(&self.identity.host_id, &self.identity.capabilities, coordinator.max_tasks_per_poll, coordinator.poll_wait())
                .await
            {
                Ok(tasks) => {
                    backoff = Duration::from_secs(1);
                    if !tasks.is_empty() {
                        info!("Received {} task(s)", tasks.len());
                    }
                    for task in tasks {
                        dispatcher.dispatch(task);
                    }
                    dispatcher.release_idle(&self.executor.keys().await);
                }
                Err(e) => {
                    warn!("Task poll failed: {}, retrying in {:?}", e, backoff);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
                }
            }
        }
    }

    async fn telemetry_loop(&self) {
        let mut sampler = ResourceSampler::new();
        let mut ticker = interval(self.config.telemetry.scrape_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let host_id = &self.identity.host_id;

        loop {
            ticker.tick().await;
            let views = self.executor.views().await;
            if views.is_empty() {
                continue;
            }
            let samples = telemetry::collect(self.client.http(), &mut sampler, host_id, &views).await;
            for batch in telemetry::batches(host_id, samples, self.config.telemetry.push_batch_size) {
                match self.client.push_metrics(&batch).await {
                    Ok(accepted) => debug!("Pushed {} samples ({} accepted)", batch.samples.len(), accepted),
                    Err(e) => warn!("Metrics push failed, {} samples dropped: {}", batch.samples.len(), e),
                }
            }
        }
    }
}

struct Worker {
    queue: mpsc::UnboundedSender<Task>,
    pending: Arc<AtomicUsize>,
}

/// Routes tasks to one sequential worker per pipeline
pub struct Dispatcher {
    executor: Arc<Executor>,
    workers: HashMap<PipelineKey, Worker>,
    seen: HashSet<(String, u32)>,
    seen_order: VecDeque<(String, u32)>,
}

impl Dispatcher {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor, workers: HashMap::new(), seen: HashSet::new(), seen_order: VecDeque::new() }
    }

    /// Queue a task behind the others of its pipeline. A redelivery of a task
    /// this agent already accepted (same id and attempt) is dropped.
    pub fn dispatch(&mut self, task: Task) -> bool {
        let id = (task.id.clone(), task.attempt);
        if !self.seen.insert(id.clone()) {
            debug!("Task {} already accepted, ignoring redelivery", task.id);
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_TASKS {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        let key = task.pipeline_key();
        let mut task = task;
        if let Some(worker) = self.workers.get(&key) {
            worker.pending.fetch_add(1, Ordering::SeqCst);
            match worker.queue.send(task) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    warn!("Worker for {} is gone, replacing it", key);
                    task = returned;
                }
            }
        }

        let worker = spawn_worker(self.executor.clone(), key.clone());
        worker.pending.fetch_add(1, Ordering::SeqCst);
        // freshly created receiver, cannot be closed
        let _ = worker.queue.send(task);
        self.workers.insert(key, worker);
        true
    }

    /// Drop workers with nothing queued whose pipeline no longer exists
    pub fn release_idle(&mut self, live: &[PipelineKey]) {
        self.workers
            .retain(|key, worker| worker.pending.load(Ordering::SeqCst) > 0 || live.contains(key));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn spawn_worker(executor: Arc<Executor>, key: PipelineKey) -> Worker {
    let (queue, mut tasks) = mpsc::unbounded_channel::<Task>();
    let pending = Arc::new(AtomicUsize::new(0));
    let counter = pending.clone();

    tokio::spawn(async move {
        while let Some(task) = tasks.recv().await {
            executor.execute(task).await;
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Worker for {} released", key);
    });

    Worker { queue, pending }
}
