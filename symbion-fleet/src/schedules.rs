//! Schedule catalogue and run history.

use crate::cron::CronPattern;
use crate::error::{FleetError, Result};
use crate::inventory::Inventory;
use crate::models::{
    GroupId, HostId, Schedule, ScheduleId, ScheduleReport, ScheduleScope, ScriptId,
};
use crate::store::{EntityStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

/// Forme saisie d'une portée : exactement une des deux listes doit être non vide
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeInput {
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub host_ids: Vec<HostId>,
}

impl TryFrom<ScopeInput> for ScheduleScope {
    type Error = FleetError;

    fn try_from(input: ScopeInput) -> Result<Self> {
        match (input.group_ids.is_empty(), input.host_ids.is_empty()) {
            (false, true) => Ok(ScheduleScope::Groups(input.group_ids)),
            (true, false) => Ok(ScheduleScope::Hosts(input.host_ids)),
            (false, false) => Err(FleetError::InvalidScope(
                "groups and hosts are mutually exclusive",
            )),
            (true, true) => Err(FleetError::InvalidScope("a group or host list is required")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInput {
    pub name: String,
    pub script_id: ScriptId,
    #[serde(flatten)]
    pub scope: ScopeInput,
    pub pattern: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Champs d'une planification une fois l'entrée validée
struct ValidSchedule {
    name: String,
    script_id: ScriptId,
    scope: ScheduleScope,
    pattern: String,
    enabled: bool,
}

/// Rapports conservés par planification si rien n'est configuré
pub const DEFAULT_REPORT_RETENTION: usize = 200;

pub struct ScheduleBook {
    schedules: Arc<dyn EntityStore<Schedule>>,
    reports: Arc<dyn EntityStore<ScheduleReport>>,
    inventory: Arc<Inventory>,
    /// 0 = historique complet
    report_retention: usize,
}

impl ScheduleBook {
    pub fn new(
        schedules: Arc<dyn EntityStore<Schedule>>,
        reports: Arc<dyn EntityStore<ScheduleReport>>,
        inventory: Arc<Inventory>,
    ) -> Self {
        Self {
            schedules,
            reports,
            inventory,
            report_retention: DEFAULT_REPORT_RETENTION,
        }
    }

    pub fn with_report_retention(mut self, keep: usize) -> Self {
        self.report_retention = keep;
        self
    }

    /// Valide l'entrée ; aucune écriture n'a lieu si une règle est violée
    fn validate(&self, input: ScheduleInput) -> Result<ValidSchedule> {
        if input.name.trim().is_empty() {
            return Err(FleetError::Validation("name must not be empty".into()));
        }
        input.pattern.parse::<CronPattern>()?;
        self.inventory.script(input.script_id)?;

        let scope = ScheduleScope::try_from(input.scope)?;
        let mut seen = HashSet::new();
        match &scope {
            ScheduleScope::Groups(ids) => {
                for id in ids {
                    if !seen.insert(*id) {
                        return Err(FleetError::InvalidScope("duplicate group in scope"));
                    }
                    self.inventory.group(*id)?;
                }
            }
            ScheduleScope::Hosts(ids) => {
                for id in ids {
                    if !seen.insert(*id) {
                        return Err(FleetError::InvalidScope("duplicate host in scope"));
                    }
                    self.inventory.host(*id)?;
                }
            }
        }
        Ok(ValidSchedule {
            name: input.name,
            script_id: input.script_id,
            scope,
            pattern: input.pattern,
            enabled: input.enabled,
        })
    }

    pub fn schedule(&self, schedule_id: ScheduleId) -> Result<Schedule> {
        self.schedules.get(schedule_id)?.ok_or(FleetError::NotFound {
            kind: "schedule",
            id: schedule_id,
        })
    }

    pub fn schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self.schedules.get_all(true)?)
    }

    pub fn create(&self, input: ScheduleInput) -> Result<Schedule> {
        let schedule = self.inventory.with_write_lock(|| {
            let valid = self.validate(input)?;
            let schedule = Schedule {
                id: Uuid::new_v4(),
                name: valid.name,
                script_id: valid.script_id,
                scope: valid.scope,
                pattern: valid.pattern,
                enabled: valid.enabled,
                last_run_time: None,
            };
            self.schedules.add(schedule.clone())?;
            Ok::<_, FleetError>(schedule)
        })?;
        info!(schedule_id = %schedule.id, name = %schedule.name, pattern = %schedule.pattern, "schedule created");
        Ok(schedule)
    }

    pub fn update(&self, schedule_id: ScheduleId, input: ScheduleInput) -> Result<Schedule> {
        let schedule = self.inventory.with_write_lock(|| {
            let mut schedule = self.schedule(schedule_id)?;
            let valid = self.validate(input)?;
            schedule.name = valid.name;
            schedule.script_id = valid.script_id;
            schedule.scope = valid.scope;
            schedule.pattern = valid.pattern;
            schedule.enabled = valid.enabled;
            self.schedules.update(schedule.clone())?;
            Ok::<_, FleetError>(schedule)
        })?;
        info!(%schedule_id, "schedule updated");
        Ok(schedule)
    }

    pub fn delete(&self, schedule_id: ScheduleId) -> Result<()> {
        self.schedules.delete(schedule_id)?;
        info!(%schedule_id, "schedule deleted");
        Ok(())
    }

    pub(crate) fn mark_run(&self, schedule_id: ScheduleId, at: OffsetDateTime) -> Result<()> {
        let mut schedule = self.schedule(schedule_id)?;
        schedule.last_run_time = Some(at);
        self.schedules.update(schedule)?;
        Ok(())
    }

    /// Ajoute un rapport puis retire les plus anciens au-delà de la rétention
    pub(crate) fn record_report(&self, report: ScheduleReport) -> std::result::Result<(), StoreError> {
        let schedule_id = report.schedule_id;
        self.reports.add(report)?;
        if self.report_retention == 0 {
            return Ok(());
        }
        let mut history = self
            .reports
            .get_by_index("schedule_id", &schedule_id.to_string())?;
        if history.len() <= self.report_retention {
            return Ok(());
        }
        history.sort_by_key(|r| r.started_at);
        let expired = history.len() - self.report_retention;
        for old in &history[..expired] {
            self.reports.delete(old.id)?;
        }
        debug!(%schedule_id, expired, "old schedule reports pruned");
        Ok(())
    }

    /// Historique d'une planification, du plus ancien au plus récent
    pub fn reports_for(&self, schedule_id: ScheduleId) -> Result<Vec<ScheduleReport>> {
        let mut reports = self
            .reports
            .get_by_index("schedule_id", &schedule_id.to_string())?;
        reports.sort_by_key(|r| r.started_at);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{GroupInput, HostInput, ScriptInput};
    use crate::membership::MembershipCache;
    use crate::models::{Group, Host, RegisterRule, Script};
    use crate::reachability::ReachabilityTracker;
    use crate::store::JsonTable;
    use parking_lot::Mutex;

    fn setup() -> (ScheduleBook, Arc<Inventory>) {
        let schedules: Arc<JsonTable<Schedule>> = Arc::new(JsonTable::in_memory());
        let inventory = Arc::new(Inventory::new(
            Arc::new(JsonTable::<Host>::in_memory()),
            Arc::new(JsonTable::<Group>::in_memory()),
            Arc::new(JsonTable::<Script>::in_memory()),
            Arc::new(JsonTable::<RegisterRule>::in_memory()),
            schedules.clone(),
            Arc::new(MembershipCache::new()),
            Arc::new(ReachabilityTracker::new()),
            Arc::new(Mutex::new(())),
        ));
        let book = ScheduleBook::new(
            schedules,
            Arc::new(JsonTable::<ScheduleReport>::in_memory()),
            inventory.clone(),
        );
        (book, inventory)
    }

    fn input(script_id: ScriptId, scope: ScopeInput) -> ScheduleInput {
        ScheduleInput {
            name: "nightly".into(),
            script_id,
            scope,
            pattern: "0 3 * * *".into(),
            enabled: true,
        }
    }

    #[test]
    fn test_scope_exclusivity_on_create_and_edit() {
        let (book, inv) = setup();
        let script = inv
            .create_script(ScriptInput { name: "s".into(), content: "true".into(), ..Default::default() })
            .unwrap();
        let g = inv.create_group(GroupInput { name: "g".into(), ..Default::default() }).unwrap();
        let h = inv
            .create_host(HostInput { name: "h".into(), address: "10.0.0.1".into(), port: 7022, enabled: true, ..Default::default() })
            .unwrap();

        let both = ScopeInput { group_ids: vec![g.id], host_ids: vec![h.id] };
        assert!(matches!(book.create(input(script.id, both.clone())), Err(FleetError::InvalidScope(_))));
        assert!(matches!(
            book.create(input(script.id, ScopeInput::default())),
            Err(FleetError::InvalidScope(_))
        ));

        let s = book
            .create(input(script.id, ScopeInput { group_ids: vec![g.id], host_ids: vec![] }))
            .unwrap();
        assert_eq!(s.scope, ScheduleScope::Groups(vec![g.id]));

        assert!(matches!(book.update(s.id, input(script.id, both)), Err(FleetError::InvalidScope(_))));
        assert_eq!(book.schedule(s.id).unwrap().scope, ScheduleScope::Groups(vec![g.id]));

        let s = book
            .update(s.id, input(script.id, ScopeInput { group_ids: vec![], host_ids: vec![h.id] }))
            .unwrap();
        assert_eq!(s.scope, ScheduleScope::Hosts(vec![h.id]));
    }

    #[test]
    fn test_invalid_cron_and_unknown_script() {
        let (book, inv) = setup();
        let g = inv.create_group(GroupInput { name: "g".into(), ..Default::default() }).unwrap();
        let scope = ScopeInput { group_ids: vec![g.id], host_ids: vec![] };
        assert!(matches!(
            book.create(input(Uuid::new_v4(), scope.clone())),
            Err(FleetError::NotFound { kind: "script", .. })
        ));
        let script = inv
            .create_script(ScriptInput { name: "s".into(), content: "true".into(), ..Default::default() })
            .unwrap();
        let mut bad = input(script.id, scope);
        bad.pattern = "every day".into();
        assert!(matches!(book.create(bad), Err(FleetError::InvalidCron(_))));
    }

    fn report(schedule_id: ScheduleId, minute: u8) -> ScheduleReport {
        let at = time::macros::datetime!(2024-05-01 03:00 UTC)
            + time::Duration::minutes(i64::from(minute));
        ScheduleReport {
            id: Uuid::new_v4(),
            schedule_id,
            host_ids: vec![],
            started_at: at,
            finished_at: at,
            elapsed_secs: 0.0,
            host_results: Default::default(),
            result: crate::models::ScheduleResult::Success,
        }
    }

    #[test]
    fn test_report_history_is_capped_per_schedule() {
        let (book, _) = setup();
        let book = book.with_report_retention(3);
        let (nightly, hourly) = (Uuid::new_v4(), Uuid::new_v4());
        for minute in 0..5 {
            book.record_report(report(nightly, minute)).unwrap();
        }
        book.record_report(report(hourly, 0)).unwrap();

        let kept = book.reports_for(nightly).unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].started_at, report(nightly, 2).started_at);
        assert_eq!(book.reports_for(hourly).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_group_deletion_never_leaves_dangling_scope() {
        let (book, inv) = setup();
        let script = inv
            .create_script(ScriptInput { name: "s".into(), content: "true".into(), ..Default::default() })
            .unwrap();
        inv.create_group(GroupInput { name: "keep".into(), ..Default::default() }).unwrap();

        for round in 0..50 {
            let g = inv
                .create_group(GroupInput { name: format!("g{round}"), ..Default::default() })
                .unwrap();
            let scope = ScopeInput { group_ids: vec![g.id], host_ids: vec![] };
            let (created, deleted) = std::thread::scope(|s| {
                let create = s.spawn(|| book.create(input(script.id, scope)));
                let delete = s.spawn(|| inv.delete_group(g.id));
                (create.join().unwrap(), delete.join().unwrap())
            });
            match (created, deleted) {
                (Ok(schedule), Err(FleetError::GroupInUse { .. })) => book.delete(schedule.id).unwrap(),
                (Err(FleetError::NotFound { kind: "group", .. }), Ok(())) => {}
                other => panic!("round {round}: inconsistent outcome {other:?}"),
            }
        }
    }

    #[test]
    fn test_input_accepts_flat_scope_fields() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "name": "n",
            "script_id": id,
            "host_ids": [id],
            "pattern": "@hourly"
        });
        let parsed: ScheduleInput = serde_json::from_value(json).unwrap();
        assert!(parsed.enabled);
        assert_eq!(ScheduleScope::try_from(parsed.scope).unwrap(), ScheduleScope::Hosts(vec![id]));
    }
}
