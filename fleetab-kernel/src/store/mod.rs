/**
 * STORE - Relations durables (expériences, tâches, pipelines actifs)
 *
 * RÔLE : Source de vérité du plan de contrôle. Un redémarrage du kernel relit le
 * snapshot et reprend là où il s'était arrêté.
 *
 * FONCTIONNEMENT :
 * - Mutations en mémoire, drapeau `dirty` partagé par les trois relations
 * - Flusher en tâche de fond : écriture atomique du snapshot JSON si dirty
 * - Flush explicite à l'arrêt
 */

mod experiments;
mod pipelines;
pub mod snapshot;
mod tasks;

pub use experiments::ExperimentStore;
pub use pipelines::PipelineStore;
pub use snapshot::JsonFile;
pub use tasks::TaskStore;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::models::{ActivePipeline, Experiment, Task, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0} already exists")]
    Duplicate(String),

    #[error("invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is owned by {owner:?}, not {reporter}")]
    NotOwner {
        task_id: String,
        owner: Option<String>,
        reporter: String,
    },

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    Conflict { id: String, expected: u64, actual: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub pipelines: Vec<ActivePipeline>,
}

pub struct Store {
    pub tasks: TaskStore,
    pub experiments: ExperimentStore,
    pub pipelines: PipelineStore,
    dirty: Arc<AtomicBool>,
    snapshot_file: Option<JsonFile>,
}

pub type SharedStore = Arc<Store>;

impl Store {
    fn with_file(snapshot_file: Option<JsonFile>) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        Self {
            tasks: TaskStore::new(dirty.clone()),
            experiments: ExperimentStore::new(dirty.clone()),
            pipelines: PipelineStore::new(dirty.clone()),
            dirty,
            snapshot_file,
        }
    }

    /// Store non persisté (tests, mode éphémère)
    pub fn in_memory() -> Self {
        Self::with_file(None)
    }

    /// Ouvre `<data_dir>/store.json` et recharge son contenu s'il existe
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let file = JsonFile::new(data_dir.join("store.json"));
        let snapshot: Option<StoreSnapshot> = file.load().await?;
        let store = Self::with_file(Some(file));

        match snapshot {
            Some(snapshot) => {
                info!(
                    "[store] restored {} experiments, {} tasks, {} pipelines",
                    snapshot.experiments.len(),
                    snapshot.tasks.len(),
                    snapshot.pipelines.len()
                );
                store.experiments.restore(snapshot.experiments);
                store.tasks.restore(snapshot.tasks);
                store.pipelines.restore(snapshot.pipelines);
            }
            None => info!("[store] no existing snapshot, starting fresh"),
        }
        Ok(store)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            experiments: self.experiments.list(),
            tasks: self.tasks.snapshot(),
            pipelines: self.pipelines.snapshot(),
        }
    }

    /// Écrit le snapshot si des mutations sont en attente
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let Some(file) = &self.snapshot_file else {
            self.dirty.store(false, Ordering::Release);
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.snapshot();
        if let Err(e) = file.save(&snapshot).await {
            // on retentera au prochain tick
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    pub fn spawn_flusher(store: SharedStore, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = store.flush().await {
                    error!("[store] snapshot flush failed: {}", e);
                }
            }
        })
    }
}
