use crate::inventory::Inventory;
use crate::reachability::ReachabilityTracker;
use crate::schedules::ScheduleBook;
use crate::trust::TrustState;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

pub const HEALTH_TOPIC: &str = "symbion/fleet/health@v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetHealth {
    pub uptime_seconds: u64,
    pub hosts: usize,
    pub groups: usize,
    pub schedules: usize,
    pub reachable_hosts: usize,
    pub unreachable_hosts: usize,
    /// Hôtes en attente d'approbation ou en conflit d'identité
    pub trust_pending: usize,
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
            mqtt_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn snapshot(
        &self,
        inventory: &Inventory,
        book: &ScheduleBook,
        reachability: &ReachabilityTracker,
    ) -> crate::error::Result<FleetHealth> {
        let hosts = inventory.hosts()?;
        let mut reachable_hosts = 0;
        let mut unreachable_hosts = 0;
        for host in &hosts {
            match reachability.last_heartbeat(host) {
                Some(hb) if hb.is_reachable => reachable_hosts += 1,
                Some(_) => unreachable_hosts += 1,
                None => {}
            }
        }
        let trust_pending = hosts
            .iter()
            .filter(|h| TrustState::of(&h.trust).needs_review())
            .count();

        Ok(FleetHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts: hosts.len(),
            groups: inventory.groups()?.len(),
            schedules: book.schedules()?.len(),
            reachable_hosts,
            unreachable_hosts,
            trust_pending,
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        })
    }
}

/// Publie périodiquement l'état de la flotte jusqu'à l'arrêt
pub fn spawn_health_publisher<F>(
    client: AsyncClient,
    interval: Duration,
    snapshot: F,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> crate::error::Result<FleetHealth> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let health = match snapshot() {
                        Ok(h) => h,
                        Err(e) => {
                            warn!(error = %e, "health snapshot failed");
                            continue;
                        }
                    };
                    match serde_json::to_vec(&health) {
                        Ok(payload) => {
                            if let Err(e) = client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                                warn!(error = %e, "failed to publish fleet health");
                            } else {
                                debug!(uptime = health.uptime_seconds, hosts = health.hosts, "fleet health published");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode fleet health"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
