/**
 * REACHABILITY TRACKER - Dernier contact connu de chaque adresse
 *
 * RÔLE : observabilité et décisions de pré-vol (ignorer un hôte injoignable).
 *
 * FONCTIONNEMENT :
 * - un Heartbeat par adresse : dernière tentative + dernière réponse réussie
 * - upserts idempotents, pas d'historique au-delà du dernier essai
 * - cleanup() borne la table au nombre d'hôtes vivants
 * - un seul Mutex pour lectures et écritures (faible cardinalité)
 * - persistance JSON par flush périodique, rechargée au démarrage
 *
 * NOTE : l'indexation par adresse survit au churn d'ID (delete + re-register)
 * mais fusionne l'historique de deux hôtes successifs sur la même adresse.
 */

use crate::models::{Heartbeat, Host};
use crate::state::{new_state, Shared};
use crate::store::StoreError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ReachabilityTracker {
    heartbeats: Shared<HashMap<String, Heartbeat>>,
    data_file: Option<PathBuf>,
}

impl Default for ReachabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReachabilityTracker {
    pub fn new() -> Self {
        Self {
            heartbeats: new_state(HashMap::new()),
            data_file: None,
        }
    }

    /// Charge `heartbeats.json` s'il existe ; les flush suivants y écrivent
    pub fn with_data_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut map = HashMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let entries: Vec<Heartbeat> =
                serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                    kind: "heartbeat",
                    path: path.clone(),
                    source,
                })?;
            for hb in entries {
                map.insert(hb.address.clone(), hb);
            }
            info!(count = map.len(), "heartbeats loaded");
        }
        Ok(Self {
            heartbeats: new_state(map),
            data_file: Some(path),
        })
    }

    pub fn mark_reachable(&self, host: &Host) {
        let now = OffsetDateTime::now_utc();
        self.heartbeats.lock().insert(
            host.address.clone(),
            Heartbeat {
                address: host.address.clone(),
                is_reachable: true,
                last_reply: Some(now),
                last_attempt: now,
            },
        );
    }

    pub fn mark_unreachable(&self, host: &Host) {
        let now = OffsetDateTime::now_utc();
        let mut map = self.heartbeats.lock();
        let last_reply = map.get(&host.address).and_then(|hb| hb.last_reply);
        map.insert(
            host.address.clone(),
            Heartbeat {
                address: host.address.clone(),
                is_reachable: false,
                last_reply,
                last_attempt: now,
            },
        );
        debug!(address = %host.address, "host marked unreachable");
    }

    pub fn last_heartbeat(&self, host: &Host) -> Option<Heartbeat> {
        self.heartbeats.lock().get(&host.address).cloned()
    }

    /// Vrai si la dernière tentative a échoué il y a moins de `window`
    pub fn recently_unreachable(&self, host: &Host, window: Duration) -> bool {
        let Some(hb) = self.last_heartbeat(host) else {
            return false;
        };
        let age = OffsetDateTime::now_utc() - hb.last_attempt;
        !hb.is_reachable && age < window
    }

    /// Supprime les entrées dont l'adresse ne correspond plus à aucun hôte
    pub fn cleanup(&self, live_hosts: &[Host]) -> usize {
        let live: HashSet<&str> = live_hosts.iter().map(|h| h.address.as_str()).collect();
        let mut map = self.heartbeats.lock();
        let before = map.len();
        map.retain(|address, _| live.contains(address.as_str()));
        let removed = before - map.len();
        if removed > 0 {
            info!(removed, "stale heartbeats removed");
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<Heartbeat> {
        let mut list: Vec<Heartbeat> = self.heartbeats.lock().values().cloned().collect();
        list.sort_by(|a, b| a.address.cmp(&b.address));
        list
    }

    /// Écrit la table sur disque (no-op sans fichier configuré)
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Flush périodique jusqu'à l'arrêt, puis un dernier flush
    pub fn spawn_flush_loop(
        tracker: std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.flush() {
                            warn!(error = %e, "failed to flush heartbeats");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            if let Err(e) = tracker.flush() {
                warn!(error = %e, "failed to flush heartbeats at shutdown");
            }
        })
    }
}
