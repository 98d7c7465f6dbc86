use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::agents::SharedAgentRegistry;
use crate::config::MqttConf;
use crate::events::EventBus;
use crate::health::HealthTracker;
use crate::store::Store;

pub const EVENTS_TOPIC: &str = "fleetab/experiments/events@v1";
pub const HEALTH_TOPIC: &str = "fleetab/kernel/health@v1";

/// Bridge optionnel : transitions d'expériences + health kernel toutes les 30s
pub fn spawn_mqtt_bridge(
    conf: MqttConf,
    events: EventBus,
    health: HealthTracker,
    store: Arc<Store>,
    agents: SharedAgentRegistry,
    metrics_backend: &'static str,
) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("fleetab-kernel", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        info!("[kernel] MQTT bridge to {}:{}", conf.host, conf.port);

        let mut rx = events.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(payload) => {
                            if let Err(e) = client.publish(EVENTS_TOPIC, QoS::AtLeastOnce, false, payload).await {
                                warn!("[events] failed to publish transition: {:?}", e);
                            }
                        }
                        Err(e) => error!("[events] cannot encode event: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!("[events] MQTT bridge lagged, skipped {}", skipped),
                    Err(RecvError::Closed) => return,
                },
                _ = interval.tick() => {
                    let snapshot = health.get_health(&store, &agents, metrics_backend);
                    if let Ok(payload) = serde_json::to_string(&snapshot) {
                        if let Err(e) = client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                            warn!("[health] failed to publish: {:?}", e);
                        } else {
                            debug!("[health] published kernel health (uptime: {}s)", snapshot.uptime_seconds);
                        }
                    }
                },
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => health.mark_mqtt_connected(),
                    Ok(_) => {}
                    Err(e) => {
                        error!("[kernel] MQTT error: {:?}", e);
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
            }
        }
    });
}
