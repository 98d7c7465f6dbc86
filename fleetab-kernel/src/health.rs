use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

use crate::agents::AgentRegistry;
use crate::store::Store;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub experiments_total: u32,
    pub experiments_active: u32,
    pub agents_healthy: u32,
    pub agents_degraded: u32,
    pub agents_lost: u32,
    pub metrics_backend: String,
    pub memory_usage_mb: Option<f32>,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, store: &Store, agents: &AgentRegistry, metrics_backend: &str) -> KernelHealth {
        let experiments = store.experiments.list();
        let active = experiments.iter().filter(|e| e.state.is_active()).count();
        let (healthy, degraded, lost) = agents.liveness_counts(OffsetDateTime::now_utc());

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            experiments_total: experiments.len() as u32,
            experiments_active: active as u32,
            agents_healthy: healthy as u32,
            agents_degraded: degraded as u32,
            agents_lost: lost as u32,
            metrics_backend: metrics_backend.to_string(),
            memory_usage_mb: memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// RSS du processus (Linux uniquement)
fn memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb = status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
