//! Process supervision for collectors and load generators
//!
//! One independent control loop per managed process:
//! - Start succeeds once the process survives the startup grace period
//! - Unexpected exits are restarted with backoff until the budget is spent
//! - Stop sends SIGTERM, waits up to the stop timeout, then SIGKILL
//! - Update is stop, swap spec, start
//!
//! Exhausted restart budgets are announced on the failure channel so the
//! runtime can send an immediate heartbeat.

mod state;

pub use state::{ExitDecision, ProcessState, RestartPolicy};

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SupervisorSettings;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pipeline {0} is not managed by this agent")]
    NotManaged(String),
    #[error("process terminated during startup: {0}")]
    Terminated(String),
    #[error("supervision loop of {0} is gone")]
    Stopped(String),
    #[error("cannot confirm termination: {0}")]
    Kill(#[source] std::io::Error),
}

/// How to launch a process. `command` runs through the platform shell.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub restart: RestartPolicy,
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
}

impl From<&SupervisorSettings> for SupervisorConfig {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            restart: RestartPolicy { max_restarts: settings.max_restarts, backoff: settings.restart_backoff() },
            startup_grace: settings.startup_grace(),
            stop_timeout: settings.stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restarts: u32,
}

/// Process name + failure reason, sent when a process gives up
pub type FailureNotice = (String, String);

enum Control {
    Stop(oneshot::Sender<Result<(), SupervisorError>>),
    Update(ProcessSpec, oneshot::Sender<Result<(), SupervisorError>>),
}

/// Handle on a supervised process. Dropping it terminates the process.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    control: mpsc::Sender<Control>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.snapshot.borrow().pid
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Graceful stop, returns once the process exit is confirmed
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        if self.snapshot().state == ProcessState::Stopped {
            return Ok(());
        }
        let (reply, done) = oneshot::channel();
        self.control
            .send(Control::Stop(reply))
            .await
            .map_err(|_| SupervisorError::Stopped(self.name.clone()))?;
        done.await.map_err(|_| SupervisorError::Stopped(self.name.clone()))?
    }

    /// Stop, swap spec, start again under the startup grace period
    pub async fn update(&self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        let (reply, done) = oneshot::channel();
        self.control
            .send(Control::Update(spec, reply))
            .await
            .map_err(|_| SupervisorError::Stopped(self.name.clone()))?;
        done.await.map_err(|_| SupervisorError::Stopped(self.name.clone()))?
    }
}

/// Launch a process and hand it to its own control loop
pub async fn start(
    name: impl Into<String>,
    spec: ProcessSpec,
    config: SupervisorConfig,
    failures: mpsc::UnboundedSender<FailureNotice>,
) -> Result<ProcessHandle, SupervisorError> {
    let name = name.into();
    let child = launch(&spec, config.startup_grace).await?;
    let pid = child.id();
    info!("Started {} (pid {:?})", name, pid);

    let (snapshot_tx, snapshot) = watch::channel(Snapshot { state: ProcessState::Running, pid, restarts: 0 });
    let (control, control_rx) = mpsc::channel(8);

    let loop_state = Supervision {
        name: name.clone(),
        spec,
        config,
        child: Some(child),
        restarts: 0,
        snapshot: snapshot_tx,
        failures,
    };
    tokio::spawn(loop_state.run(control_rx));

    Ok(ProcessHandle { name, control, snapshot })
}

struct Supervision {
    name: String,
    spec: ProcessSpec,
    config: SupervisorConfig,
    child: Option<Child>,
    restarts: u32,
    snapshot: watch::Sender<Snapshot>,
    failures: mpsc::UnboundedSender<FailureNotice>,
}

impl Supervision {
    async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        loop {
            tokio::select! {
                status = wait_child(&mut self.child) => self.on_unexpected_exit(status).await,
                command = control.recv() => match command {
                    Some(Control::Stop(reply)) => {
                        let result = self.shutdown().await;
                        let _ = reply.send(result);
                        break;
                    }
                    Some(Control::Update(spec, reply)) => {
                        let result = self.restart_with(spec).await;
                        let _ = reply.send(result);
                    }
                    None => {
                        debug!("Handle of {} dropped, terminating", self.name);
                        let _ = self.shutdown().await;
                        break;
                    }
                },
            }
        }
    }

    fn publish(&self, state: ProcessState) {
        let pid = self.child.as_ref().and_then(Child::id);
        let restarts = self.restarts;
        self.snapshot.send_replace(Snapshot { state, pid, restarts });
    }

    async fn on_unexpected_exit(&mut self, status: std::io::Result<ExitStatus>) {
        self.child = None;
        let mut reason = describe_exit(status);
        warn!("{} exited unexpectedly: {}", self.name, reason);

        loop {
            let (attempt, delay) = match self.config.restart.after_exit(self.restarts) {
                ExitDecision::Restart { attempt, delay } => (attempt, delay),
                ExitDecision::GiveUp => {
                    let reason = format!(
                        "{reason}, restart budget of {} exhausted",
                        self.config.restart.max_restarts
                    );
                    warn!("{} failed: {}", self.name, reason);
                    self.publish(ProcessState::Failed(reason.clone()));
                    let _ = self.failures.send((self.name.clone(), reason));
                    return;
                }
            };

            self.restarts = attempt;
            self.publish(ProcessState::Restarting(attempt));
            info!("Restarting {} in {:?} (attempt {}/{})", self.name, delay, attempt, self.config.restart.max_restarts);
            sleep(delay).await;

            match spawn(&self.spec) {
                Ok(child) => {
                    self.child = Some(child);
                    self.publish(ProcessState::Running);
                    return;
                }
                Err(e) => reason = e.to_string(),
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        self.publish(ProcessState::Stopping);
        if let Some(mut child) = self.child.take() {
            terminate(&mut child, self.config.stop_timeout).await.map_err(SupervisorError::Kill)?;
        }
        self.publish(ProcessState::Stopped);
        info!("Stopped {}", self.name);
        Ok(())
    }

    async fn restart_with(&mut self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        self.shutdown().await?;
        self.spec = spec;
        self.publish(ProcessState::Starting);

        match launch(&self.spec, self.config.startup_grace).await {
            Ok(child) => {
                self.child = Some(child);
                self.restarts = 0;
                self.publish(ProcessState::Running);
                info!("Updated {} (pid {:?})", self.name, self.child.as_ref().and_then(Child::id));
                Ok(())
            }
            Err(e) => {
                self.publish(ProcessState::Failed(e.to_string()));
                Err(e)
            }
        }
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => format!("process exited ({status})"),
        Err(e) => format!("cannot wait for process: {e}"),
    }
}

fn spawn(spec: &ProcessSpec) -> Result<Child, SupervisorError> {
    let mut command = if cfg!(target_os = "windows") {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(&spec.command);
        command
    } else {
        // exec: the shell is replaced, signals reach the process itself
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!("exec {}", spec.command));
        command
    };
    command
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = &spec.work_dir {
        command.current_dir(dir);
    }
    command.spawn().map_err(|source| SupervisorError::Spawn { command: spec.command.clone(), source })
}

async fn launch(spec: &ProcessSpec, grace: Duration) -> Result<Child, SupervisorError> {
    let mut child = spawn(spec)?;
    tokio::select! {
        status = child.wait() => Err(SupervisorError::Terminated(describe_exit(status))),
        _ = sleep(grace) => Ok(child),
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

/// SIGTERM, wait up to `timeout`, then SIGKILL and reap
async fn terminate(child: &mut Child, timeout: Duration) -> std::io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    request_termination(child);
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map(|_| ()),
        Err(_) => {
            warn!("Process {:?} ignored SIGTERM for {:?}, killing", child.id(), timeout);
            child.kill().await
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn spec(command: &str) -> ProcessSpec {
        ProcessSpec { command: command.to_string(), env: Vec::new(), work_dir: None }
    }

    fn config(max_restarts: u32) -> SupervisorConfig {
        SupervisorConfig {
            restart: RestartPolicy { max_restarts, backoff: Duration::from_millis(20) },
            startup_grace: Duration::from_millis(150),
            stop_timeout: Duration::from_millis(500),
        }
    }

    fn alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn start_then_stop_confirms_exit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = start("sleeper", spec("sleep 30"), config(1), tx).await.unwrap();
        let pid = handle.pid().unwrap();
        assert!(alive(pid));
        assert_eq!(handle.snapshot().state, ProcessState::Running);

        handle.stop().await.unwrap();
        assert_eq!(handle.snapshot().state, ProcessState::Stopped);
        assert!(!alive(pid));

        // idempotent
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exit_during_grace_fails_the_start() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = start("broken", spec("sh -c 'exit 3'"), config(3), tx).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Terminated(ref m) if m.contains('3')), "{err}");

        let (tx, _rx) = mpsc::unbounded_channel();
        let missing = start("missing", spec("/nonexistent/otelcol"), config(3), tx).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn crash_loop_exhausts_restart_budget() {
        let (tx, mut failures) = mpsc::unbounded_channel();
        let handle = start("flaky", spec("sleep 0.3"), config(2), tx).await.unwrap();

        let (name, reason) = tokio::time::timeout(Duration::from_secs(10), failures.recv())
            .await
            .expect("no failure notice")
            .unwrap();
        assert_eq!(name, "flaky");
        assert!(reason.contains("restart budget of 2 exhausted"));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.restarts, 2);
        assert!(matches!(snapshot.state, ProcessState::Failed(_)));
        assert!(snapshot.pid.is_none());

        // a failed process can still be stopped cleanly
        handle.stop().await.unwrap();
        assert_eq!(handle.snapshot().state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let stubborn = r#"sh -c 'trap "" TERM; while true; do sleep 0.05; done'"#;
        let handle = start("stubborn", spec(stubborn), config(0), tx).await.unwrap();
        let pid = handle.pid().unwrap();

        let began = Instant::now();
        handle.stop().await.unwrap();
        assert!(began.elapsed() >= Duration::from_millis(500));
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn update_swaps_the_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = start("collector", spec("sleep 30"), config(1), tx).await.unwrap();
        let old_pid = handle.pid().unwrap();

        handle.update(spec("sleep 31")).await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, ProcessState::Running);
        assert_ne!(snapshot.pid, Some(old_pid));
        assert!(!alive(old_pid));

        let failed = handle.update(spec("sh -c 'exit 1'")).await;
        assert!(failed.is_err());
        assert!(matches!(handle.snapshot().state, ProcessState::Failed(_)));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stopping_one_process_leaves_others_running() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = start("a", spec("sleep 30"), config(1), tx.clone()).await.unwrap();
        let b = start("b", spec("sleep 30"), config(1), tx).await.unwrap();

        a.stop().await.unwrap();
        assert_eq!(b.snapshot().state, ProcessState::Running);
        assert!(alive(b.pid().unwrap()));
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn environment_and_work_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut with_env = spec(r#"sh -c 'echo "$FLEETAB_VARIANT" > variant.txt; sleep 30'"#);
        with_env.env.push(("FLEETAB_VARIANT".into(), "candidate".into()));
        with_env.work_dir = Some(dir.path().to_path_buf());

        let handle = start("env", with_env, config(0), tx).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("variant.txt")).unwrap();
        assert_eq!(written.trim(), "candidate");
        handle.stop().await.unwrap();
    }
}
