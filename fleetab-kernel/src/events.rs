/**
 * EVENT BROADCASTER - Canal d'abonnement aux transitions d'expériences
 *
 * RÔLE : Diffuser chaque transition d'état (SSE, bridge MQTT, tests).
 *
 * FONCTIONNEMENT : tokio broadcast, un abonné trop lent perd les événements
 * les plus anciens (Lagged) au lieu de bloquer le controller.
 * `close()` signale l'arrêt : les flux longue durée (SSE) se terminent.
 */

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::models::{ExperimentId, ExperimentState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_id: ExperimentId,
    pub from: Option<ExperimentState>,
    pub to: ExperimentState,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExperimentEvent>,
    closed: Arc<watch::Sender<bool>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self { sender, closed: Arc::new(closed) }
    }

    /// Arrêt du kernel : les abonnés longue durée doivent se terminer
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Résout une fois `close()` appelé (immédiatement si déjà fermé)
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    pub fn publish(&self, event: ExperimentEvent) {
        // aucun abonné : rien à faire
        if let Err(e) = self.sender.send(event) {
            debug!("[events] no subscriber for {:?}", e.0.experiment_id);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
