use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::models::PhaseDurations;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub api_key: Option<String>,
    pub mqtt: Option<MqttConf>,
    pub metrics: MetricsConf,
    pub controller: ControllerConf,
    pub coordinator: CoordinatorConf,
    /// Secrets nommés, exigés par `required_credentials`
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConf {
    /// URL Prometheus-compatible, absent = backend en mémoire
    pub backend_url: Option<String>,
    pub cache_capacity: usize,
    pub query_step_secs: u64,
    pub request_timeout_secs: u64,
    pub retry_attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ControllerConf {
    pub evaluation_interval_secs: u64,
    pub default_quorum: f64,
    pub default_alpha: f64,
    pub default_durations: PhaseDurations,
    pub max_task_attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorConf {
    pub max_wait_secs: u64,
    pub max_tasks_per_poll: usize,
    pub degraded_after_secs: u64,
    pub lost_after_secs: u64,
    pub reclaim_interval_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            data_dir: PathBuf::from("./data"),
            api_key: None,
            mqtt: None,
            metrics: MetricsConf::default(),
            controller: ControllerConf::default(),
            coordinator: CoordinatorConf::default(),
            credentials: HashMap::new(),
        }
    }
}

impl Default for MetricsConf {
    fn default() -> Self {
        Self {
            backend_url: None,
            cache_capacity: 50_000,
            query_step_secs: 15,
            request_timeout_secs: 10,
            retry_attempts: 4,
        }
    }
}

impl Default for ControllerConf {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 5,
            default_quorum: 0.5,
            default_alpha: crate::analysis::DEFAULT_ALPHA,
            default_durations: PhaseDurations::default(),
            max_task_attempts: 3,
        }
    }
}

impl Default for CoordinatorConf {
    fn default() -> Self {
        Self {
            max_wait_secs: 30,
            max_tasks_per_poll: 8,
            degraded_after_secs: 30,
            lost_after_secs: 90,
            reclaim_interval_secs: 10,
        }
    }
}

impl CoordinatorConf {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl KernelConfig {
    /// Applique les variables d'environnement FLEETAB_*
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("FLEETAB_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(dir) = std::env::var("FLEETAB_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(listen) = std::env::var("FLEETAB_LISTEN") {
            self.listen = listen;
        }
        if let Ok(url) = std::env::var("FLEETAB_METRICS_URL") {
            self.metrics.backend_url = Some(url);
        }
    }

    /// Secret nommé : `FLEETAB_CRED_<NAME>` prioritaire sur la section `credentials`
    pub fn credential(&self, name: &str) -> Option<String> {
        let env_name = format!(
            "FLEETAB_CRED_{}",
            name.to_ascii_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_")
        );
        std::env::var(env_name)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.credentials.get(name).cloned())
    }
}

pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!("[kernel] no {}, using default config", path.display());
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!("[kernel] invalid config {}: {e}", path.display());
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEETAB_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut config = load_config_from(Path::new(&path)).await;
    config.apply_env();
    info!("[kernel] config loaded (listen {}, data_dir {})", config.listen, config.data_dir.display());
    config
}
