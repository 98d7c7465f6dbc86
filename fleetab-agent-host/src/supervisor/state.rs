//! Lifecycle of a supervised process
//!
//! ```text
//! Starting ──► Running ──► Restarting(n) ──► Running
//!                 │              │
//!                 │              └──► Failed (budget exhausted)
//!                 └──► Stopping ──► Stopped
//! ```

use std::time::Duration;

use crate::protocol::PipelineStatus;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Restarting(u32),
    Failed(String),
    Stopping,
    Stopped,
}

impl ProcessState {
    /// No process left to supervise
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Failed(_) | ProcessState::Stopped)
    }

    /// Status carried in heartbeat pipeline reports
    pub fn pipeline_status(&self) -> PipelineStatus {
        match self {
            ProcessState::Failed(_) => PipelineStatus::Failed,
            ProcessState::Stopped => PipelineStatus::Stopped,
            ProcessState::Starting | ProcessState::Running | ProcessState::Restarting(_) | ProcessState::Stopping => {
                PipelineStatus::Running
            }
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            ProcessState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// What to do after an unexpected exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
    Restart { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    /// `restarts_used` restarts already spent since the last successful start
    pub fn after_exit(&self, restarts_used: u32) -> ExitDecision {
        if restarts_used >= self.max_restarts {
            return ExitDecision::GiveUp;
        }
        let attempt = restarts_used + 1;
        let factor = 1u32 << (attempt - 1).min(16);
        let delay = self.backoff.saturating_mul(factor).min(MAX_BACKOFF);
        ExitDecision::Restart { attempt, delay }
    }
}
