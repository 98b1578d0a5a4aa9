/*!
Harness de test pour le plan de contrôle

Kernel complet (tables en mémoire ou sur disque) branché sur un
`StubTransport`. Chaque adresse d'hôte reçoit un agent scripté ; les
requêtes envoyées restent consultables pour les assertions.
*/

use crate::fixtures::FleetFixtures;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use symbion_fleet::models::{Group, GroupId, Host, Script, ScheduleId, ScheduleReport};
use symbion_fleet::reachability::ReachabilityTracker;
use symbion_fleet::transport::stub::{StubAgent, StubTransport};
use symbion_fleet::transport::AgentRequest;
use symbion_fleet::{FleetKernel, FleetStores, KernelOptions};
use tracing::info;

/// Harness de test complet pour le kernel de flotte
pub struct FleetHarness {
    pub kernel: Arc<FleetKernel>,
    pub transport: StubTransport,
}

impl FleetHarness {
    /// Kernel en mémoire avec les options par défaut
    pub fn new() -> Result<Self> {
        Self::with_options(KernelOptions::default())
    }

    pub fn with_options(options: KernelOptions) -> Result<Self> {
        Self::with_stores(FleetStores::in_memory(), options)
    }

    /// Kernel sur des tables fournies par le test (pannes de stockage, ...)
    pub fn with_stores(stores: FleetStores, options: KernelOptions) -> Result<Self> {
        init_test_tracing();
        Self::build(stores, Arc::new(ReachabilityTracker::new()), options)
    }

    /// Kernel persistant dans `data_dir` (rechargeable par un second harness)
    pub fn on_disk<P: AsRef<Path>>(data_dir: P, options: KernelOptions) -> Result<Self> {
        init_test_tracing();
        let dir = data_dir.as_ref();
        let stores = FleetStores::open(dir).context("open test tables")?;
        let reachability = ReachabilityTracker::with_data_file(dir.join("heartbeats.json"))
            .context("open test heartbeats")?;
        Self::build(stores, Arc::new(reachability), options)
    }

    fn build(
        stores: FleetStores,
        reachability: Arc<ReachabilityTracker>,
        options: KernelOptions,
    ) -> Result<Self> {
        let transport = StubTransport::new();
        let kernel = FleetKernel::build(stores, Arc::new(transport.clone()), reachability, options)
            .context("build test kernel")?;
        Ok(Self {
            kernel: Arc::new(kernel),
            transport,
        })
    }

    pub fn add_group(&self, name: &str) -> Result<Group> {
        Ok(self.kernel.inventory().create_group(FleetFixtures::group(name))?)
    }

    pub fn add_script(&self, name: &str, content: &str) -> Result<Script> {
        Ok(self
            .kernel
            .inventory()
            .create_script(FleetFixtures::script(name, content))?)
    }

    /// Ajoute le script à la liste des scripts activés du groupe
    pub fn enable_script(&self, group: &Group, script: &Script) -> Result<Group> {
        let inventory = self.kernel.inventory();
        let mut current = inventory.group(group.id)?;
        current.script_ids.push(script.id);
        let input = symbion_fleet::inventory::GroupInput {
            name: current.name,
            script_ids: current.script_ids,
            environment: current.environment,
        };
        Ok(inventory.update_group(group.id, input)?)
    }

    pub fn add_host(&self, name: &str, address: &str, group_ids: Vec<GroupId>) -> Result<Host> {
        Ok(self
            .kernel
            .inventory()
            .create_host(FleetFixtures::host(name, address, group_ids))?)
    }

    /// Hôte + agent simulé joignable qui présente `identity`
    pub fn add_online_host(
        &self,
        name: &str,
        address: &str,
        group_ids: Vec<GroupId>,
        agent: StubAgent,
    ) -> Result<Host> {
        let host = self.add_host(name, address, group_ids)?;
        self.transport.install(address, agent);
        Ok(host)
    }

    /// Exécute une planification et attend la persistance du rapport
    pub async fn run_schedule(&self, schedule_id: ScheduleId) -> Result<Option<ScheduleReport>> {
        let Some(run) = self.kernel.run_schedule_now(schedule_id).await? else {
            return Ok(None);
        };
        run.persisted
            .await
            .context("report persistence task dropped")?
            .context("report persistence failed")?;
        Ok(Some(run.report))
    }

    /// Requêtes reçues par l'agent d'une adresse, par type
    pub fn request_kinds(&self, address: &str) -> Vec<&'static str> {
        self.transport
            .calls_to(address)
            .iter()
            .map(AgentRequest::kind)
            .collect()
    }

    /// Vérifie un champ du rapport tel qu'il serait écrit en JSON
    pub fn assert_report_field(report: &ScheduleReport, field: &str, expected: &Value) -> Result<()> {
        let json = serde_json::to_value(report)?;
        let actual = json
            .get(field)
            .with_context(|| format!("field '{field}' missing from report"))?;
        if actual != expected {
            anyhow::bail!("report field '{field}': expected {expected}, got {actual}");
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<HarnessStats> {
        Ok(HarnessStats {
            hosts: self.kernel.inventory().hosts()?.len(),
            groups: self.kernel.inventory().groups()?.len(),
            requests: self.transport.calls().len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessStats {
    pub hosts: usize,
    pub groups: usize,
    pub requests: usize,
}

impl HarnessStats {
    pub fn log(&self) {
        info!(
            hosts = self.hosts,
            groups = self.groups,
            requests = self.requests,
            "harness stats"
        );
    }
}

/// Logs de test visibles avec RUST_LOG, initialisés une seule fois
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "symbion_fleet=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_starts_with_default_group() {
        let harness = FleetHarness::new().unwrap();
        let stats = harness.stats().unwrap();
        assert_eq!(stats, HarnessStats { hosts: 0, groups: 1, requests: 0 });
    }

    #[tokio::test]
    async fn test_online_host_answers_ping() {
        let harness = FleetHarness::new().unwrap();
        let host = harness
            .add_online_host("h1", "10.1.0.1", vec![], StubAgent::new("K1"))
            .unwrap();
        harness.kernel.perform_ping(host.id).await.unwrap();
        assert_eq!(harness.request_kinds("10.1.0.1"), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_on_disk_harness_reloads_inventory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let harness = FleetHarness::on_disk(dir.path(), KernelOptions::default()).unwrap();
            let web = harness.add_group("web").unwrap();
            harness.add_host("h1", "10.1.0.1", vec![web.id]).unwrap();
        }
        let reloaded = FleetHarness::on_disk(dir.path(), KernelOptions::default()).unwrap();
        let stats = reloaded.stats().unwrap();
        assert_eq!(stats.hosts, 1);
        assert_eq!(stats.groups, 2);
        let web = reloaded
            .kernel
            .inventory()
            .groups()
            .unwrap()
            .into_iter()
            .find(|g| g.name == "web")
            .unwrap();
        assert_eq!(reloaded.kernel.list_members_of_group(web.id).len(), 1);
    }
}
