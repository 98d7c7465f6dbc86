//! FleetAB Agent Host - per-host data plane for configuration experiments
//!
//! This agent:
//! - Registers with the kernel through periodic heartbeats
//! - Long-polls for collector / load generator tasks
//! - Renders configs, supervises processes and reports task status
//! - Pushes pipeline metrics for analysis

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleetab_agent_host::config::AgentConfig;
use fleetab_agent_host::discovery::Identity;
use fleetab_agent_host::runtime::Runtime;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetab_agent_host=info")),
        )
        .init();

    info!("FleetAB Agent Host v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent config")?;
    if config.coordinator.api_key.is_none() {
        error!("No API key configured: the kernel will refuse every request");
    }
    let identity = Identity::discover(&config);

    let runtime = Runtime::new(config, identity).context("Failed to create agent")?;
    runtime
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Agent execution failed")?;

    Ok(())
}
