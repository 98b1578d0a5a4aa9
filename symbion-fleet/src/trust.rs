//! Trust-on-first-use bookkeeping for agent identities.
//!
//! The first identity an agent presents is only *recorded*; an administrator
//! promotes it to trusted. Once trusted, any other identity puts the host in
//! conflict until promoted or reset. Enforcement is the transport's job.

use crate::error::{FleetError, Result};
use crate::models::{Host, HostId, HostTrust};
use crate::store::EntityStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// Jamais contacté
    Unprovisioned,
    /// Une identité a été vue, aucune n'est approuvée
    AwaitingTrust,
    Trusted,
    /// L'identité présentée diffère de l'identité approuvée
    Conflict,
}

impl TrustState {
    pub fn of(trust: &HostTrust) -> Self {
        match (trust.trusted_identity.is_empty(), trust.untrusted_identity.is_empty()) {
            (true, true) => TrustState::Unprovisioned,
            (true, false) => TrustState::AwaitingTrust,
            (false, true) => TrustState::Trusted,
            (false, false) => TrustState::Conflict,
        }
    }

    /// Demande une action administrateur
    pub fn needs_review(self) -> bool {
        matches!(self, TrustState::AwaitingTrust | TrustState::Conflict)
    }
}

/// Applique un contact ; renvoie vrai si l'état a changé
pub fn apply_contact(trust: &mut HostTrust, presented: &str, now: OffsetDateTime) -> bool {
    if presented.is_empty() {
        return false;
    }
    let changed = if trust.trusted_identity == presented {
        !std::mem::take(&mut trust.untrusted_identity).is_empty()
    } else if trust.untrusted_identity != presented {
        trust.untrusted_identity = presented.to_string();
        true
    } else {
        false
    };
    if changed {
        trust.last_trust_update = Some(now);
    }
    changed
}

pub struct TrustManager {
    hosts: Arc<dyn EntityStore<Host>>,
    write_lock: Arc<Mutex<()>>,
}

impl TrustManager {
    /// `write_lock` est partagé avec l'inventaire : une seule écriture d'hôte à la fois
    pub fn new(hosts: Arc<dyn EntityStore<Host>>, write_lock: Arc<Mutex<()>>) -> Self {
        Self { hosts, write_lock }
    }

    fn load(&self, host_id: HostId) -> Result<Host> {
        self.hosts.get(host_id)?.ok_or(FleetError::NotFound {
            kind: "host",
            id: host_id,
        })
    }

    pub fn state(&self, host_id: HostId) -> Result<TrustState> {
        Ok(TrustState::of(&self.load(host_id)?.trust))
    }

    /// Enregistre l'identité présentée lors d'un contact
    pub fn record_contact(&self, host_id: HostId, presented: &str) -> Result<TrustState> {
        let _guard = self.write_lock.lock();
        let mut host = self.load(host_id)?;
        if apply_contact(&mut host.trust, presented, OffsetDateTime::now_utc()) {
            let state = TrustState::of(&host.trust);
            match state {
                TrustState::Conflict => warn!(
                    %host_id,
                    presented,
                    trusted = %host.trust.trusted_identity,
                    "agent presented an identity different from the trusted one"
                ),
                TrustState::AwaitingTrust => {
                    info!(%host_id, presented, "new agent identity awaiting trust")
                }
                _ => {}
            }
            self.hosts.update(host)?;
            return Ok(state);
        }
        Ok(TrustState::of(&host.trust))
    }

    /// Approuve l'identité actuellement en attente
    pub fn promote(&self, host_id: HostId, identity: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut host = self.load(host_id)?;
        if identity.is_empty() || host.trust.untrusted_identity != identity {
            return Err(FleetError::Validation(format!(
                "identity '{identity}' is not the pending identity of host '{}'",
                host.name
            )));
        }
        host.trust.trusted_identity = std::mem::take(&mut host.trust.untrusted_identity);
        host.trust.last_trust_update = Some(OffsetDateTime::now_utc());
        info!(%host_id, identity, "agent identity promoted to trusted");
        self.hosts.update(host)?;
        Ok(())
    }

    /// Oublie toute identité (agent réinstallé)
    pub fn reset(&self, host_id: HostId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut host = self.load(host_id)?;
        host.trust = HostTrust {
            last_trust_update: Some(OffsetDateTime::now_utc()),
            ..HostTrust::default()
        };
        info!(%host_id, "agent trust reset");
        self.hosts.update(host)?;
        Ok(())
    }
}
