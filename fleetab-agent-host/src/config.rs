//! Agent configuration with secure API key storage
//!
//! Handles:
//! - Coordinator endpoint, API key and polling cadence
//! - Agent identity (host id generated and persisted on first run)
//! - Process supervision budgets and work directory
//! - Default collector / load generator command lines
//! - Telemetry scrape and push settings
//!
//! The file lives at `<config_dir>/fleetab-agent/config.toml` unless
//! `FLEETAB_AGENT_CONFIG` points elsewhere. The API key can be kept in the OS
//! keyring instead of the file.

use anyhow::{bail, Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const KEYRING_SERVICE: &str = "fleetab-agent";
const KEYRING_USER: &str = "api-key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub agent: AgentInfo,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Keep the API key in the OS keyring rather than in this file
    pub use_keyring: bool,
    pub poll_wait_secs: u64,
    pub max_tasks_per_poll: usize,
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfo {
    pub host_id: String,
    pub hostname: String,
    pub version: String,
    /// Overrides capability detection when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub max_restarts: u32,
    pub restart_backoff_ms: u64,
    pub startup_grace_ms: u64,
    pub stop_timeout_ms: u64,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// `{config}` is replaced by the rendered config path
    pub collector: String,
    pub load_sim: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub scrape_interval_secs: u64,
    pub push_batch_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            use_keyring: false,
            poll_wait_secs: 25,
            max_tasks_per_poll: 8,
            request_timeout_secs: 10,
            heartbeat_interval_secs: 15,
        }
    }
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            host_id: uuid::Uuid::new_v4().to_string(),
            hostname: hostname::get().unwrap_or_default().to_string_lossy().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: None,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        let work_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("fleetab-agent")
            .join("work");
        Self {
            max_restarts: 3,
            restart_backoff_ms: 1_000,
            startup_grace_ms: 2_000,
            stop_timeout_ms: 10_000,
            work_dir,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            collector: "otelcol --config {config}".to_string(),
            load_sim: "telemetrygen metrics --config {config}".to_string(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            scrape_interval_secs: 15,
            push_batch_size: 500,
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl SupervisorSettings {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl TelemetryConfig {
    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs.max(1))
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, writing defaults on first run,
    /// then apply environment overrides and resolve the API key.
    pub async fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        let mut config = Self::load_from(&path).await?;
        config.apply_env_overrides();
        config.resolve_api_key();
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; a missing file is created with defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AgentConfig =
                toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            info!("First run: writing default config to {}", path.display());
            let config = Self::default();
            config.save_to(path).await?;
            Ok(config)
        }
    }

    /// Save config; with `use_keyring` the API key goes to the keyring, never to the file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut on_disk = self.clone();
        if self.coordinator.use_keyring {
            if let Some(key) = on_disk.coordinator.api_key.take() {
                Self::save_api_key(&key)?;
            }
        }

        let content = toml::to_string_pretty(&on_disk)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// `FLEETAB_AGENT_CONFIG` or `<config_dir>/fleetab-agent/config.toml`
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(explicit) = std::env::var("FLEETAB_AGENT_CONFIG") {
            if !explicit.is_empty() {
                return Ok(PathBuf::from(explicit));
            }
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("fleetab-agent");
        path.push("config.toml");
        Ok(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FLEETAB_COORDINATOR_URL") {
            if !url.is_empty() {
                self.coordinator.url = url;
            }
        }
        if let Ok(key) = std::env::var("FLEETAB_API_KEY") {
            if !key.is_empty() {
                self.coordinator.api_key = Some(key);
            }
        }
    }

    fn resolve_api_key(&mut self) {
        if self.coordinator.api_key.is_some() || !self.coordinator.use_keyring {
            return;
        }
        match Self::load_api_key() {
            Ok(key) => self.coordinator.api_key = Some(key),
            Err(e) => warn!("API key not found in keyring: {}", e),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.coordinator.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("coordinator.url must be an http(s) URL, got {:?}", self.coordinator.url);
        }
        if self.agent.host_id.trim().is_empty() {
            bail!("agent.host_id must not be empty");
        }
        if self.telemetry.push_batch_size == 0 {
            bail!("telemetry.push_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Load API key from secure OS keyring
    fn load_api_key() -> Result<String> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
        entry.get_password().map_err(Into::into)
    }

    /// Save API key to secure OS keyring
    fn save_api_key(key: &str) -> Result<()> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
        entry.set_password(key).map_err(Into::into)
    }
}
