/**
 * AGENTS REGISTRY - Registre des agents de la flotte
 *
 * RÔLE : Upsert d'un AgentRecord à chaque heartbeat, persistance agents.json,
 * liveness dérivée de l'âge du dernier heartbeat.
 *
 * FONCTIONNEMENT :
 * - Aucun message de désinscription : un agent devient Lost par simple absence de heartbeat
 * - La liveness n'est jamais stockée, elle est recalculée à chaque lecture
 * - Sauvegarde à la première inscription d'un hôte + job périodique
 */

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::models::{AgentRecord, HostId, Liveness, PipelineReport, ResourceSnapshot};
use crate::store::{JsonFile, StoreError};

/// Seuils de liveness en secondes
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub degraded_after_secs: u64,
    pub lost_after_secs: u64,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self { degraded_after_secs: 30, lost_after_secs: 90 }
    }
}

impl LivenessPolicy {
    pub fn liveness(&self, last_heartbeat: OffsetDateTime, now: OffsetDateTime) -> Liveness {
        let age = crate::state::age_secs(now, last_heartbeat) as u64;
        if age >= self.lost_after_secs {
            Liveness::Lost
        } else if age >= self.degraded_after_secs {
            Liveness::Degraded
        } else {
            Liveness::Healthy
        }
    }
}

/// Heartbeat tel que reçu de l'agent
#[derive(Debug, Clone)]
pub struct HeartbeatInfo {
    pub host_id: HostId,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub resources: Option<ResourceSnapshot>,
    pub pipelines: Vec<PipelineReport>,
}

/// Vue API : enregistrement + liveness calculée
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub liveness: Liveness,
    pub heartbeat_age_secs: i64,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<HostId, AgentRecord>>,
    policy: LivenessPolicy,
    data_file: Option<JsonFile>,
    dirty: AtomicBool,
}

pub type SharedAgentRegistry = Arc<AgentRegistry>;

impl AgentRegistry {
    pub fn new(policy: LivenessPolicy) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            policy,
            data_file: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Registre persisté dans `<data_dir>/agents.json`
    pub async fn open(data_dir: &Path, policy: LivenessPolicy) -> Result<Self, StoreError> {
        let file = JsonFile::new(data_dir.join("agents.json"));
        let loaded: Option<HashMap<HostId, AgentRecord>> = file.load().await?;
        let mut registry = Self::new(policy);
        match loaded {
            Some(agents) => {
                info!("[agents] loaded {} agents from {}", agents.len(), file.path().display());
                *registry.agents.get_mut() = agents;
            }
            None => info!("[agents] no existing agents file, starting fresh"),
        }
        registry.data_file = Some(file);
        Ok(registry)
    }

    pub fn policy(&self) -> LivenessPolicy {
        self.policy
    }

    /// Upsert sur heartbeat. Retourne true si l'hôte était inconnu.
    pub fn record_heartbeat(&self, hb: HeartbeatInfo, now: OffsetDateTime) -> bool {
        let mut agents = self.agents.write();
        let is_new = !agents.contains_key(&hb.host_id);

        let registered_at = agents.get(&hb.host_id).map(|a| a.registered_at).unwrap_or(now);
        if let Some(previous) = agents.get(&hb.host_id) {
            if self.policy.liveness(previous.last_heartbeat, now) == Liveness::Lost {
                info!("[agents] host {} is back after being lost", hb.host_id);
            }
        }

        agents.insert(
            hb.host_id.clone(),
            AgentRecord {
                host_id: hb.host_id.clone(),
                hostname: hb.hostname,
                capabilities: hb.capabilities,
                version: hb.version,
                os: hb.os,
                arch: hb.arch,
                last_heartbeat: now,
                registered_at,
                resources: hb.resources,
                pipelines: hb.pipelines,
            },
        );
        self.dirty.store(true, Ordering::Release);

        if is_new {
            info!("[agents] registered host {}", hb.host_id);
        }
        is_new
    }

    pub fn get(&self, host_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(host_id).cloned()
    }

    pub fn last_heartbeat(&self, host_id: &str) -> Option<OffsetDateTime> {
        self.agents.read().get(host_id).map(|a| a.last_heartbeat)
    }

    /// Un hôte jamais vu est considéré Lost
    pub fn liveness(&self, host_id: &str, now: OffsetDateTime) -> Liveness {
        self.last_heartbeat(host_id)
            .map(|hb| self.policy.liveness(hb, now))
            .unwrap_or(Liveness::Lost)
    }

    pub fn view(&self, host_id: &str, now: OffsetDateTime) -> Option<AgentView> {
        self.get(host_id).map(|record| self.to_view(record, now))
    }

    fn to_view(&self, record: AgentRecord, now: OffsetDateTime) -> AgentView {
        AgentView {
            liveness: self.policy.liveness(record.last_heartbeat, now),
            heartbeat_age_secs: crate::state::age_secs(now, record.last_heartbeat),
            record,
        }
    }

    pub fn list(&self, now: OffsetDateTime) -> Vec<AgentView> {
        let mut records: Vec<AgentRecord> = self.agents.read().values().cloned().collect();
        records.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        records.into_iter().map(|r| self.to_view(r, now)).collect()
    }

    /// Compteurs Healthy / Degraded / Lost
    pub fn liveness_counts(&self, now: OffsetDateTime) -> (usize, usize, usize) {
        let agents = self.agents.read();
        agents.values().fold((0, 0, 0), |(h, d, l), a| match self.policy.liveness(a.last_heartbeat, now) {
            Liveness::Healthy => (h + 1, d, l),
            Liveness::Degraded => (h, d + 1, l),
            Liveness::Lost => (h, d, l + 1),
        })
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let Some(file) = &self.data_file else { return Ok(()) };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = self.agents.read().clone();
        if let Err(e) = file.save(&snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Sauvegarde périodique + trace des hôtes qui viennent de passer Lost
    pub fn start_monitoring(registry: SharedAgentRegistry, every: Duration) -> tokio::task::JoinHandle<()> {
        info!("[agents] starting agent monitoring (every {:?})", every);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            let mut known_lost: Vec<HostId> = Vec::new();
            loop {
                interval.tick().await;
                let now = OffsetDateTime::now_utc();

                let lost: Vec<HostId> = registry
                    .list(now)
                    .into_iter()
                    .filter(|v| v.liveness == Liveness::Lost)
                    .map(|v| v.record.host_id)
                    .collect();
                for host in lost.iter().filter(|h| !known_lost.contains(h)) {
                    warn!("[agents] host {} is lost (no heartbeat)", host);
                }
                known_lost = lost;

                if let Err(e) = registry.save().await {
                    error!("[agents] failed to save agents: {}", e);
                }
            }
        })
    }
}
