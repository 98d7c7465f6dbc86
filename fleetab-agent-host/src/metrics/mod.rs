//! Host and process metrics for the agent
//!
//! - Resource snapshot carried by every heartbeat (CPU %, memory, load average)
//! - Per-process CPU / memory of supervised pipelines
//! - Prometheus scrape of each pipeline's own metrics endpoint (see `scrape`)

pub mod scrape;

use sysinfo::{Pid, System};
use tracing::debug;

use crate::protocol::ResourceSnapshot;

const MB: u64 = 1024 * 1024;

/// CPU and memory of one process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Keeps its `System` between samples so CPU usage is measured over the interval
pub struct ResourceSampler {
    sys: System,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys }
    }

    pub fn snapshot(&mut self) -> ResourceSnapshot {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let total_bytes = self.sys.total_memory();
        let used_bytes = total_bytes.saturating_sub(self.sys.available_memory());

        // Load averages are Unix-only
        let load_avg = if cfg!(unix) {
            let load = System::load_average();
            [load.one, load.five, load.fifteen]
        } else {
            [0.0, 0.0, 0.0]
        };

        let snapshot = ResourceSnapshot {
            cpu_percent: self.sys.global_cpu_info().cpu_usage(),
            memory_used_mb: used_bytes / MB,
            memory_total_mb: total_bytes / MB,
            load_avg,
        };
        debug!("Resource snapshot: {:?}", snapshot);
        snapshot
    }

    /// `None` once the process is gone
    pub fn process_usage(&mut self, pid: u32) -> Option<ProcessUsage> {
        let pid = Pid::from_u32(pid);
        if !self.sys.refresh_process(pid) {
            return None;
        }
        self.sys.process(pid).map(|p| ProcessUsage {
            cpu_percent: p.cpu_usage(),
            memory_bytes: p.memory(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_memory() {
        let mut sampler = ResourceSampler::new();
        let snapshot = sampler.snapshot();
        assert!(snapshot.memory_total_mb > 0);
        assert!(snapshot.memory_used_mb <= snapshot.memory_total_mb);
        assert!(snapshot.cpu_percent >= 0.0);
    }

    #[test]
    fn own_process_is_visible_and_unknown_pid_is_not() {
        let mut sampler = ResourceSampler::new();
        let usage = sampler.process_usage(std::process::id()).unwrap();
        assert!(usage.memory_bytes > 0);
        assert!(sampler.process_usage(u32::MAX - 1).is_none());
    }
}
