/**
 * INVENTORY - Hôtes, groupes et scripts
 *
 * RÔLE : seul chemin d'écriture des hôtes et des groupes. Chaque écriture
 * valide l'intégrité référentielle, persiste, puis reconstruit le cache
 * d'appartenance avant de rendre la main.
 *
 * RÈGLES :
 * - noms et adresses d'hôtes uniques, noms de groupes/scripts uniques
 * - group_ids d'un hôte : tous existants, sans doublon (au moment de l'édition)
 * - un groupe n'est supprimable que vide, hors groupe par défaut, non référencé
 *   par une règle ou une planification, et s'il n'est pas le dernier
 * - les écritures d'hôtes partagent un verrou avec le TrustManager
 */

use crate::error::{FleetError, GroupInUse, Result};
use crate::membership::MembershipCache;
use crate::models::{
    Environment, Group, GroupId, Host, HostId, PostAction, RegisterRule, Schedule, Script,
    ScriptId,
};
use crate::reachability::ReachabilityTracker;
use crate::state::{new_rw_state, SharedRw};
use crate::store::EntityStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

/// Secret partagé aléatoire (32 octets, base64)
pub fn generate_psk() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInput {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Généré si absent
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Champs modifiables d'un hôte ; None = inchangé
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub enabled: Option<bool>,
    pub group_ids: Option<Vec<GroupId>>,
    pub environment: Option<Environment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupInput {
    pub name: String,
    #[serde(default)]
    pub script_ids: Vec<ScriptId>,
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptInput {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub post_action: Option<PostAction>,
}

pub struct Inventory {
    hosts: Arc<dyn EntityStore<Host>>,
    groups: Arc<dyn EntityStore<Group>>,
    scripts: Arc<dyn EntityStore<Script>>,
    rules: Arc<dyn EntityStore<RegisterRule>>,
    schedules: Arc<dyn EntityStore<Schedule>>,
    membership: Arc<MembershipCache>,
    reachability: Arc<ReachabilityTracker>,
    write_lock: Arc<Mutex<()>>,
    default_group: SharedRw<Option<GroupId>>,
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(FleetError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn no_duplicates(field: &str, ids: &[Uuid]) -> Result<()> {
    let mut seen = HashSet::new();
    if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
        return Err(FleetError::Validation(format!("{field} contains {dup} twice")));
    }
    Ok(())
}

impl Inventory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Arc<dyn EntityStore<Host>>,
        groups: Arc<dyn EntityStore<Group>>,
        scripts: Arc<dyn EntityStore<Script>>,
        rules: Arc<dyn EntityStore<RegisterRule>>,
        schedules: Arc<dyn EntityStore<Schedule>>,
        membership: Arc<MembershipCache>,
        reachability: Arc<ReachabilityTracker>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            hosts,
            groups,
            scripts,
            rules,
            schedules,
            membership,
            reachability,
            write_lock,
            default_group: new_rw_state(None),
        }
    }

    /// Reconstruit le cache ; un échec ici est fatal
    pub fn rebuild(&self) -> Result<()> {
        self.membership
            .rebuild(self.groups.as_ref(), self.hosts.as_ref())
            .map_err(FleetError::CacheRebuild)
    }

    /// Retire les heartbeats des adresses qui ne correspondent plus à un hôte
    pub fn prune_heartbeats(&self) -> usize {
        match self.hosts.get_all(false) {
            Ok(live) => self.reachability.cleanup(&live),
            Err(e) => {
                warn!(error = %e, "reachability cleanup skipped");
                0
            }
        }
    }

    /// Exécute `f` sous le verrou d'écriture de l'inventaire ; les écritures
    /// qui référencent un groupe ou un script s'y sérialisent avec les
    /// suppressions. `f` ne doit pas appeler une écriture de l'inventaire.
    pub fn with_write_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.write_lock.lock();
        f()
    }

    // ============ GROUPE PAR DÉFAUT ============

    /// Garantit l'existence du groupe d'enregistrement par défaut
    pub fn ensure_default_group(&self, name: &str) -> Result<GroupId> {
        let existing = self.groups.get_by_unique("name", name)?;
        let id = match existing {
            Some(group) => group.id,
            None => {
                let group = self.create_group(GroupInput {
                    name: name.to_string(),
                    ..GroupInput::default()
                })?;
                info!(group = name, "default registration group created");
                group.id
            }
        };
        *self.default_group.write() = Some(id);
        Ok(id)
    }

    pub fn default_group(&self) -> Option<GroupId> {
        *self.default_group.read()
    }

    pub fn set_default_group(&self, group_id: GroupId) -> Result<()> {
        self.group(group_id)?;
        *self.default_group.write() = Some(group_id);
        info!(%group_id, "default registration group changed");
        Ok(())
    }

    // ============ HÔTES ============

    pub fn host(&self, host_id: HostId) -> Result<Host> {
        self.hosts.get(host_id)?.ok_or(FleetError::NotFound {
            kind: "host",
            id: host_id,
        })
    }

    pub fn hosts(&self) -> Result<Vec<Host>> {
        Ok(self.hosts.get_all(true)?)
    }

    fn check_group_refs(&self, group_ids: &[GroupId]) -> Result<()> {
        no_duplicates("group_ids", group_ids)?;
        for id in group_ids {
            if self.groups.get(*id)?.is_none() {
                return Err(FleetError::NotFound { kind: "group", id: *id });
            }
        }
        Ok(())
    }

    pub fn create_host(&self, input: HostInput) -> Result<Host> {
        non_empty("name", &input.name)?;
        non_empty("address", &input.address)?;
        if input.port == 0 {
            return Err(FleetError::Validation("port must not be 0".into()));
        }

        let _guard = self.write_lock.lock();
        self.check_group_refs(&input.group_ids)?;
        let host = Host {
            id: Uuid::new_v4(),
            name: input.name,
            address: input.address,
            port: input.port,
            enabled: input.enabled,
            psk: input.psk.filter(|p| !p.is_empty()).unwrap_or_else(generate_psk),
            group_ids: input.group_ids,
            trust: Default::default(),
            environment: input.environment,
            created_at: OffsetDateTime::now_utc(),
        };
        self.hosts.add(host.clone())?;
        self.rebuild()?;
        info!(host_id = %host.id, name = %host.name, address = %host.address, "host created");
        Ok(host)
    }

    pub fn update_host(&self, host_id: HostId, update: HostUpdate) -> Result<Host> {
        let _guard = self.write_lock.lock();
        let mut host = self.host(host_id)?;
        if let Some(name) = update.name {
            non_empty("name", &name)?;
            host.name = name;
        }
        if let Some(address) = update.address {
            non_empty("address", &address)?;
            host.address = address;
        }
        if let Some(port) = update.port {
            if port == 0 {
                return Err(FleetError::Validation("port must not be 0".into()));
            }
            host.port = port;
        }
        if let Some(enabled) = update.enabled {
            host.enabled = enabled;
        }
        if let Some(group_ids) = update.group_ids {
            self.check_group_refs(&group_ids)?;
            host.group_ids = group_ids;
        }
        if let Some(environment) = update.environment {
            host.environment = environment;
        }
        self.hosts.update(host.clone())?;
        self.rebuild()?;
        info!(%host_id, "host updated");
        Ok(host)
    }

    pub fn delete_host(&self, host_id: HostId) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.hosts.delete(host_id)?;
        self.rebuild()?;
        self.prune_heartbeats();
        info!(%host_id, "host deleted");
        Ok(())
    }

    /// Nouveau secret partagé ; l'état de confiance est conservé
    pub fn rotate_psk(&self, host_id: HostId) -> Result<String> {
        let _guard = self.write_lock.lock();
        let mut host = self.host(host_id)?;
        host.psk = generate_psk();
        let psk = host.psk.clone();
        self.hosts.update(host)?;
        info!(%host_id, "host psk rotated");
        Ok(psk)
    }

    /// Vrai si un des groupes de l'hôte active le script
    pub fn script_enabled_for(&self, host: &Host, script_id: ScriptId) -> Result<bool> {
        for group_id in &host.group_ids {
            if let Some(group) = self.groups.get(*group_id)? {
                if group.script_ids.contains(&script_id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // ============ GROUPES ============

    pub fn group(&self, group_id: GroupId) -> Result<Group> {
        self.groups.get(group_id)?.ok_or(FleetError::NotFound {
            kind: "group",
            id: group_id,
        })
    }

    pub fn groups(&self) -> Result<Vec<Group>> {
        Ok(self.groups.get_all(true)?)
    }

    pub fn members_of(&self, group_id: GroupId) -> Vec<HostId> {
        self.membership.members_of(group_id)
    }

    fn check_script_refs(&self, script_ids: &[ScriptId]) -> Result<()> {
        no_duplicates("script_ids", script_ids)?;
        for id in script_ids {
            if self.scripts.get(*id)?.is_none() {
                return Err(FleetError::NotFound { kind: "script", id: *id });
            }
        }
        Ok(())
    }

    pub fn create_group(&self, input: GroupInput) -> Result<Group> {
        non_empty("name", &input.name)?;
        let _guard = self.write_lock.lock();
        self.check_script_refs(&input.script_ids)?;
        let group = Group {
            id: Uuid::new_v4(),
            name: input.name,
            script_ids: input.script_ids,
            environment: input.environment,
        };
        self.groups.add(group.clone())?;
        self.rebuild()?;
        info!(group_id = %group.id, name = %group.name, "group created");
        Ok(group)
    }

    pub fn update_group(&self, group_id: GroupId, input: GroupInput) -> Result<Group> {
        non_empty("name", &input.name)?;
        let _guard = self.write_lock.lock();
        let mut group = self.group(group_id)?;
        self.check_script_refs(&input.script_ids)?;
        group.name = input.name;
        group.script_ids = input.script_ids;
        group.environment = input.environment;
        self.groups.update(group.clone())?;
        info!(%group_id, "group updated");
        Ok(group)
    }

    fn deletion_blocker(&self, group: &Group) -> Result<Option<GroupInUse>> {
        if self.default_group() == Some(group.id) {
            return Ok(Some(GroupInUse::DefaultRegistrationGroup));
        }
        let members = self.membership.member_count(group.id);
        if members > 0 {
            return Ok(Some(GroupInUse::HasMembers(members)));
        }
        let key = group.id.to_string();
        if !self.rules.get_by_index("group_id", &key)?.is_empty() {
            return Ok(Some(GroupInUse::ReferencedByRule));
        }
        if !self.schedules.get_by_index("scope_group_id", &key)?.is_empty() {
            return Ok(Some(GroupInUse::ReferencedBySchedule));
        }
        if self.groups.get_all(false)?.len() <= 1 {
            return Ok(Some(GroupInUse::LastGroup));
        }
        Ok(None)
    }

    pub fn delete_group(&self, group_id: GroupId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let group = self.group(group_id)?;
        if let Some(reason) = self.deletion_blocker(&group)? {
            return Err(FleetError::GroupInUse {
                name: group.name,
                reason,
            });
        }
        self.groups.delete(group_id)?;
        self.rebuild()?;
        self.prune_heartbeats();
        info!(%group_id, name = %group.name, "group deleted");
        Ok(())
    }

    // ============ SCRIPTS ============

    pub fn script(&self, script_id: ScriptId) -> Result<Script> {
        self.scripts.get(script_id)?.ok_or(FleetError::NotFound {
            kind: "script",
            id: script_id,
        })
    }

    pub fn scripts(&self) -> Result<Vec<Script>> {
        Ok(self.scripts.get_all(true)?)
    }

    pub fn create_script(&self, input: ScriptInput) -> Result<Script> {
        non_empty("name", &input.name)?;
        non_empty("content", &input.content)?;
        let script = Script {
            id: Uuid::new_v4(),
            name: input.name,
            content: input.content,
            environment: input.environment,
            post_action: input.post_action,
        };
        self.scripts.add(script.clone())?;
        info!(script_id = %script.id, name = %script.name, "script created");
        Ok(script)
    }

    pub fn update_script(&self, script_id: ScriptId, input: ScriptInput) -> Result<Script> {
        non_empty("name", &input.name)?;
        non_empty("content", &input.content)?;
        let mut script = self.script(script_id)?;
        script.name = input.name;
        script.content = input.content;
        script.environment = input.environment;
        script.post_action = input.post_action;
        self.scripts.update(script.clone())?;
        Ok(script)
    }

    pub fn delete_script(&self, script_id: ScriptId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let script = self.script(script_id)?;
        let key = script_id.to_string();
        if let Some(group) = self.groups.get_by_index("script_id", &key)?.first() {
            return Err(FleetError::Validation(format!(
                "script '{}' is enabled in group '{}'",
                script.name, group.name
            )));
        }
        if let Some(schedule) = self.schedules.get_by_index("script_id", &key)?.first() {
            return Err(FleetError::Validation(format!(
                "script '{}' is used by schedule '{}'",
                script.name, schedule.name
            )));
        }
        self.scripts.delete(script_id)?;
        info!(%script_id, "script deleted");
        Ok(())
    }
}
