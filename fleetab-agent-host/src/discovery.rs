//! Agent identity and capability detection
//!
//! This module handles:
//! - Host id and hostname (from config, hostname detection as fallback)
//! - OS / architecture identification
//! - Capability detection: a role is offered when its command's program is an
//!   executable found on `PATH`, unless the config pins the capability list

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AgentConfig, CommandsConfig};

pub const COLLECTOR: &str = "collector";
pub const LOADSIM: &str = "loadsim";

#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub host_id: String,
    pub hostname: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub capabilities: Vec<String>,
}

impl Identity {
    pub fn discover(config: &AgentConfig) -> Self {
        let hostname = if config.agent.hostname.trim().is_empty() {
            hostname::get().unwrap_or_default().to_string_lossy().to_string()
        } else {
            config.agent.hostname.clone()
        };

        let capabilities = match &config.agent.capabilities {
            Some(pinned) => pinned.clone(),
            None => detect_capabilities(&config.commands),
        };
        if capabilities.is_empty() {
            warn!("No capability detected: this agent will never receive tasks");
        }

        let identity = Self {
            host_id: config.agent.host_id.clone(),
            hostname,
            version: config.agent.version.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            capabilities,
        };
        info!(
            "Identity: host {} ({}), {} {}, capabilities {:?}",
            identity.host_id, identity.hostname, identity.os, identity.arch, identity.capabilities
        );
        identity
    }
}

pub fn detect_capabilities(commands: &CommandsConfig) -> Vec<String> {
    let mut capabilities = Vec::new();
    for (capability, command) in [(COLLECTOR, &commands.collector), (LOADSIM, &commands.load_sim)] {
        match program_of(command).and_then(|program| which::which(program).ok()) {
            Some(path) => {
                info!("Capability {} available ({})", capability, path.display());
                capabilities.push(capability.to_string());
            }
            None => info!("Capability {} unavailable: `{}` not found", capability, command),
        }
    }
    capabilities
}

/// First word of a command line
fn program_of(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn non_executable_program_is_not_a_capability() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let otelcol = dir.path().join("otelcol");
        std::fs::write(&otelcol, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&otelcol, std::fs::Permissions::from_mode(0o644)).unwrap();

        let commands = CommandsConfig {
            collector: format!("{} --config {{config}}", otelcol.display()),
            load_sim: "/nonexistent/telemetrygen metrics".into(),
        };
        assert!(detect_capabilities(&commands).is_empty());

        std::fs::set_permissions(&otelcol, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(detect_capabilities(&commands), vec![COLLECTOR.to_string()]);
    }

    #[test]
    fn capabilities_follow_available_commands() {
        let commands = CommandsConfig {
            collector: "sh -c 'sleep 1000'".into(),
            load_sim: "fleetab-no-such-binary --rate 10".into(),
        };
        assert_eq!(detect_capabilities(&commands), vec![COLLECTOR.to_string()]);
    }

    #[test]
    fn pinned_capabilities_win() {
        let mut config = AgentConfig::default();
        config.agent.capabilities = Some(vec![LOADSIM.to_string()]);
        config.agent.hostname = "edge-07".into();

        let identity = Identity::discover(&config);
        assert_eq!(identity.capabilities, vec![LOADSIM.to_string()]);
        assert_eq!(identity.hostname, "edge-07");
        assert_eq!(identity.host_id, config.agent.host_id);
    }
}
