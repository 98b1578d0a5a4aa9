/**
 * FLEET KERNEL - Façade des opérations exposées
 *
 * RÔLE : construit explicitement tous les services (pas de globals) et
 * expose les opérations qu'une couche API ou la boucle cron appellent.
 *
 * GRAPHE :
 *   FleetStores ─┬─ Inventory ── MembershipCache
 *                ├─ TrustManager (verrou d'écriture partagé avec Inventory)
 *                ├─ Registrar ── RegistrationClassifier
 *                └─ ScheduleBook ── ScheduleEngine ── Dispatcher ── AgentTransport
 */

use crate::config::FleetConfig;
use crate::dispatch::{DispatchSettings, Dispatcher, ExitOutcome, ScriptExecution};
use crate::error::{FleetError, Result};
use crate::health::{FleetHealth, HealthTracker};
use crate::inventory::Inventory;
use crate::membership::MembershipCache;
use crate::models::{
    Group, GroupId, Heartbeat, Host, HostId, RegisterRule, Schedule, ScheduleId, ScheduleReport,
    Script, ScriptId,
};
use crate::reachability::ReachabilityTracker;
use crate::registration::{Registrar, Registration, RegistrationRequest};
use crate::scheduler::{ScheduleEngine, ScheduleRun};
use crate::schedules::{ScheduleBook, DEFAULT_REPORT_RETENTION};
use crate::store::{EntityStore, JsonTable, StoreError};
use crate::transport::{AgentTransport, ExecControl};
use crate::trust::TrustManager;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Tables de la flotte
#[derive(Clone)]
pub struct FleetStores {
    pub hosts: Arc<dyn EntityStore<Host>>,
    pub groups: Arc<dyn EntityStore<Group>>,
    pub scripts: Arc<dyn EntityStore<Script>>,
    pub rules: Arc<dyn EntityStore<RegisterRule>>,
    pub schedules: Arc<dyn EntityStore<Schedule>>,
    pub reports: Arc<dyn EntityStore<ScheduleReport>>,
}

impl FleetStores {
    pub fn in_memory() -> Self {
        Self {
            hosts: Arc::new(JsonTable::<Host>::in_memory()),
            groups: Arc::new(JsonTable::<Group>::in_memory()),
            scripts: Arc::new(JsonTable::<Script>::in_memory()),
            rules: Arc::new(JsonTable::<RegisterRule>::in_memory()),
            schedules: Arc::new(JsonTable::<Schedule>::in_memory()),
            reports: Arc::new(JsonTable::<ScheduleReport>::in_memory()),
        }
    }

    /// Ouvre (ou crée) `<data_dir>/<kind>.json` pour chaque entité
    pub fn open<P: AsRef<Path>>(data_dir: P) -> std::result::Result<Self, StoreError> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            hosts: Arc::new(JsonTable::<Host>::open(dir)?),
            groups: Arc::new(JsonTable::<Group>::open(dir)?),
            scripts: Arc::new(JsonTable::<Script>::open(dir)?),
            rules: Arc::new(JsonTable::<RegisterRule>::open(dir)?),
            schedules: Arc::new(JsonTable::<Schedule>::open(dir)?),
            reports: Arc::new(JsonTable::<ScheduleReport>::open(dir)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct KernelOptions {
    pub dispatch: DispatchSettings,
    pub skip_unreachable_for: Option<Duration>,
    pub shared_key: Option<String>,
    pub default_group: String,
    /// Rapports conservés par planification (0 = tous)
    pub report_retention: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            dispatch: DispatchSettings::default(),
            skip_unreachable_for: None,
            shared_key: None,
            default_group: "unassigned".into(),
            report_retention: DEFAULT_REPORT_RETENTION,
        }
    }
}

impl KernelOptions {
    pub fn from_config(cfg: &FleetConfig) -> Self {
        Self {
            dispatch: DispatchSettings {
                connect: cfg.dispatch.connect_options(),
                environment: cfg.environment.clone(),
            },
            skip_unreachable_for: cfg.dispatch.skip_unreachable_for(),
            shared_key: cfg.registration.shared_key.clone(),
            default_group: cfg.registration.default_group.clone(),
            report_retention: cfg.scheduler.report_retention,
        }
    }
}

pub struct FleetKernel {
    inventory: Arc<Inventory>,
    trust: Arc<TrustManager>,
    reachability: Arc<ReachabilityTracker>,
    registrar: Arc<Registrar>,
    book: Arc<ScheduleBook>,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<ScheduleEngine>,
    health: HealthTracker,
}

impl FleetKernel {
    /// Construit les services ; échoue si le cache initial ne peut être bâti
    pub fn build(
        stores: FleetStores,
        transport: Arc<dyn AgentTransport>,
        reachability: Arc<ReachabilityTracker>,
        options: KernelOptions,
    ) -> Result<Self> {
        let write_lock = Arc::new(Mutex::new(()));
        let membership = Arc::new(MembershipCache::new());
        let inventory = Arc::new(Inventory::new(
            stores.hosts.clone(),
            stores.groups.clone(),
            stores.scripts.clone(),
            stores.rules.clone(),
            stores.schedules.clone(),
            membership,
            reachability.clone(),
            write_lock.clone(),
        ));
        inventory.rebuild()?;
        let default_group = inventory.ensure_default_group(&options.default_group)?;

        let trust = Arc::new(TrustManager::new(stores.hosts.clone(), write_lock));
        let registrar = Arc::new(Registrar::new(
            stores.rules.clone(),
            inventory.clone(),
            options.shared_key,
        ));
        let book = Arc::new(
            ScheduleBook::new(stores.schedules.clone(), stores.reports.clone(), inventory.clone())
                .with_report_retention(options.report_retention),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            trust.clone(),
            reachability.clone(),
            stores.groups.clone(),
            options.dispatch,
        ));
        let engine = Arc::new(ScheduleEngine::new(
            book.clone(),
            inventory.clone(),
            dispatcher.clone(),
            reachability.clone(),
            options.skip_unreachable_for,
        ));

        info!(%default_group, "fleet kernel ready");
        Ok(Self {
            inventory,
            trust,
            reachability,
            registrar,
            book,
            dispatcher,
            engine,
            health: HealthTracker::new(),
        })
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn schedules(&self) -> &Arc<ScheduleBook> {
        &self.book
    }

    pub fn engine(&self) -> &Arc<ScheduleEngine> {
        &self.engine
    }

    pub fn reachability(&self) -> &Arc<ReachabilityTracker> {
        &self.reachability
    }

    pub fn health_tracker(&self) -> &HealthTracker {
        &self.health
    }

    fn enabled_host(&self, host_id: HostId) -> Result<Host> {
        let host = self.inventory.host(host_id)?;
        if !host.enabled {
            return Err(FleetError::HostDisabled(host.name));
        }
        Ok(host)
    }

    pub async fn perform_ping(&self, host_id: HostId) -> Result<()> {
        let host = self.enabled_host(host_id)?;
        self.dispatcher.ping(&host).await
    }

    /// Exécution à la demande ; le script doit être activé par un groupe de l'hôte
    pub async fn perform_run_script(
        &self,
        host_id: HostId,
        script_id: ScriptId,
        control: ExecControl,
    ) -> Result<ScriptExecution> {
        let host = self.enabled_host(host_id)?;
        let script = self.inventory.script(script_id)?;
        if !self.inventory.script_enabled_for(&host, script_id)? {
            return Err(FleetError::ScriptNotEnabled {
                script: script.name,
                host: host.name,
            });
        }
        self.dispatcher.run_script(&host, &script, control).await
    }

    pub async fn perform_exit(&self, host_id: HostId) -> Result<ExitOutcome> {
        let host = self.enabled_host(host_id)?;
        Ok(self.dispatcher.exit(&host).await)
    }

    pub fn register_host(&self, request: RegistrationRequest) -> Result<Registration> {
        self.registrar.register_host(request)
    }

    pub fn list_members_of_group(&self, group_id: GroupId) -> Vec<HostId> {
        self.inventory.members_of(group_id)
    }

    pub async fn run_schedule_now(&self, schedule_id: ScheduleId) -> Result<Option<ScheduleRun>> {
        self.engine.run_now(schedule_id).await
    }

    pub fn get_last_heartbeat(&self, host_id: HostId) -> Result<Option<Heartbeat>> {
        let host = self.inventory.host(host_id)?;
        Ok(self.reachability.last_heartbeat(&host))
    }

    pub fn promote_trust(&self, host_id: HostId, identity: &str) -> Result<()> {
        self.trust.promote(host_id, identity)
    }

    pub fn reset_trust(&self, host_id: HostId) -> Result<()> {
        self.trust.reset(host_id)
    }

    pub fn rotate_psk(&self, host_id: HostId) -> Result<String> {
        self.inventory.rotate_psk(host_id)
    }

    pub fn health(&self) -> Result<FleetHealth> {
        self.health
            .snapshot(&self.inventory, &self.book, &self.reachability)
    }

    /// Ping concurrent de tous les hôtes actifs ; renvoie le nombre de réponses
    pub async fn probe_all(&self) -> Result<usize> {
        let hosts: Vec<Host> = self
            .inventory
            .hosts()?
            .into_iter()
            .filter(|h| h.enabled)
            .collect();
        let mut probes = JoinSet::new();
        for host in hosts {
            let dispatcher = self.dispatcher.clone();
            probes.spawn(async move { dispatcher.ping(&host).await.is_ok() });
        }
        let mut reachable = 0;
        while let Some(joined) = probes.join_next().await {
            if matches!(joined, Ok(true)) {
                reachable += 1;
            }
        }
        self.inventory.prune_heartbeats();
        Ok(reachable)
    }

    pub fn spawn_probe_loop(
        kernel: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match kernel.probe_all().await {
                        Ok(reachable) => debug!(reachable, "reachability probe done"),
                        Err(e) => warn!(error = %e, "reachability probe failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
