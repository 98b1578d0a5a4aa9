/**
 * SCHEDULE ENGINE - Exécution des planifications sur un ensemble d'hôtes
 *
 * UNE EXÉCUTION :
 * 1. résolution de la portée (union des membres des groupes, ou liste
 *    explicite ; hôtes supprimés/désactivés ignorés avec un warning)
 * 2. portée vide → no-op journalisé, aucun rapport
 * 3. fan-out : une tâche par hôte (JoinSet), chacune n'écrit que sa propre
 *    case d'une map pré-remplie avec HOST_RESULT_NOT_RUN
 * 4. agrégat sur les hôtes réellement contactés : Fail (0 succès),
 *    PartialSuccess (certains), Success (tous, ou aucun hôte contacté)
 * 5. last_run_time mis à jour, rapport persisté dans une tâche bloquante
 *    séparée dont le résultat revient sur son propre canal
 *
 * BOUCLE CRON : réveillée à chaque frontière de minute, elle traite chaque
 * minute écoulée exactement une fois (MinuteClock) et lance une exécution
 * par planification active dont le motif correspond. Les exécutions d'une
 * même planification peuvent se chevaucher.
 */

use crate::cron::CronPattern;
use crate::dispatch::Dispatcher;
use crate::error::{FleetError, Result};
use crate::inventory::Inventory;
use crate::models::{
    Host, HostId, Schedule, ScheduleId, ScheduleReport, ScheduleResult, ScheduleScope,
    HOST_RESULT_NOT_RUN,
};
use crate::reachability::ReachabilityTracker;
use crate::schedules::ScheduleBook;
use crate::store::StoreError;
use crate::transport::ExecControl;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tri-état d'une exécution à partir des compteurs par hôte contacté
pub fn aggregate(attempted: usize, succeeded: usize) -> ScheduleResult {
    if succeeded >= attempted {
        ScheduleResult::Success
    } else if succeeded == 0 {
        ScheduleResult::Fail
    } else {
        ScheduleResult::PartialSuccess
    }
}

/// Rattrapage maximal après un réveil tardif ou un saut d'horloge
const MAX_CATCH_UP_MINUTES: i64 = 10;

fn minute_floor(at: OffsetDateTime) -> OffsetDateTime {
    at - time::Duration::new(i64::from(at.second()), at.nanosecond() as i32)
}

/// Minutes déjà traitées par la boucle cron
#[derive(Debug, Clone, Copy)]
pub struct MinuteClock {
    last_ticked: OffsetDateTime,
}

impl MinuteClock {
    /// La minute en cours au démarrage n'est pas rejouée
    pub fn starting_at(now: OffsetDateTime) -> Self {
        Self {
            last_ticked: minute_floor(now),
        }
    }

    /// Minutes entamées depuis le dernier appel, dans l'ordre ; vide si
    /// l'horloge n'a pas franchi de nouvelle minute (ou a reculé)
    pub fn advance(&mut self, now: OffsetDateTime) -> Vec<OffsetDateTime> {
        let current = minute_floor(now);
        let elapsed = (current - self.last_ticked).whole_minutes();
        if elapsed <= 0 {
            return Vec::new();
        }
        let first = if elapsed > MAX_CATCH_UP_MINUTES {
            warn!(
                skipped = elapsed - MAX_CATCH_UP_MINUTES,
                "cron loop fell behind, oldest minutes not replayed"
            );
            current - time::Duration::minutes(MAX_CATCH_UP_MINUTES - 1)
        } else {
            self.last_ticked + time::Duration::MINUTE
        };
        self.last_ticked = current;
        let mut minutes = Vec::new();
        let mut minute = first;
        while minute <= current {
            minutes.push(minute);
            minute += time::Duration::MINUTE;
        }
        minutes
    }
}

/// Résultat d'une exécution ; `persisted` indique si le rapport a été écrit
#[derive(Debug)]
pub struct ScheduleRun {
    pub report: ScheduleReport,
    pub persisted: oneshot::Receiver<std::result::Result<(), StoreError>>,
}

pub struct ScheduleEngine {
    book: Arc<ScheduleBook>,
    inventory: Arc<Inventory>,
    dispatcher: Arc<Dispatcher>,
    reachability: Arc<ReachabilityTracker>,
    skip_unreachable_for: Option<Duration>,
}

impl ScheduleEngine {
    pub fn new(
        book: Arc<ScheduleBook>,
        inventory: Arc<Inventory>,
        dispatcher: Arc<Dispatcher>,
        reachability: Arc<ReachabilityTracker>,
        skip_unreachable_for: Option<Duration>,
    ) -> Self {
        Self {
            book,
            inventory,
            dispatcher,
            reachability,
            skip_unreachable_for,
        }
    }

    /// Hôtes ciblés, dédoublonnés dans l'ordre de première apparition
    pub fn resolve_scope(&self, schedule: &Schedule) -> Result<Vec<Host>> {
        let candidates: Vec<HostId> = match &schedule.scope {
            ScheduleScope::Groups(group_ids) => group_ids
                .iter()
                .flat_map(|g| self.inventory.members_of(*g))
                .collect(),
            ScheduleScope::Hosts(host_ids) => host_ids.clone(),
        };

        let mut seen = HashSet::new();
        let mut hosts = Vec::new();
        for host_id in candidates {
            if !seen.insert(host_id) {
                continue;
            }
            match self.inventory.host(host_id) {
                Ok(host) if host.enabled => hosts.push(host),
                Ok(host) => warn!(schedule = %schedule.name, host = %host.name, "host disabled, skipped"),
                Err(FleetError::NotFound { .. }) => {
                    warn!(schedule = %schedule.name, %host_id, "host no longer exists, skipped")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(hosts)
    }

    pub async fn run(&self, schedule: &Schedule) -> Result<Option<ScheduleRun>> {
        let script = self.inventory.script(schedule.script_id)?;
        let hosts = self.resolve_scope(schedule)?;
        if hosts.is_empty() {
            info!(schedule_id = %schedule.id, name = %schedule.name, "empty scope, nothing to run");
            return Ok(None);
        }

        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        let host_ids: Vec<HostId> = hosts.iter().map(|h| h.id).collect();
        let results = Arc::new(Mutex::new(
            host_ids
                .iter()
                .map(|id| (*id, HOST_RESULT_NOT_RUN))
                .collect::<BTreeMap<HostId, i32>>(),
        ));
        info!(schedule_id = %schedule.id, name = %schedule.name, hosts = hosts.len(), "schedule run started");

        let mut tasks = JoinSet::new();
        for host in hosts {
            if let Some(window) = self.skip_unreachable_for {
                if self.reachability.recently_unreachable(&host, window) {
                    info!(schedule_id = %schedule.id, host = %host.name, "recently unreachable, not contacted");
                    continue;
                }
            }
            let dispatcher = self.dispatcher.clone();
            let script = script.clone();
            let results = results.clone();
            tasks.spawn(async move {
                match dispatcher.run_script(&host, &script, ExecControl::default()).await {
                    Ok(exec) => {
                        results.lock().insert(host.id, exec.result.exit_code);
                        exec.result.success
                    }
                    Err(e) => {
                        debug!(host_id = %host.id, error = %e, "host run failed");
                        false
                    }
                }
            });
        }

        let attempted = tasks.len();
        let mut succeeded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => warn!(schedule_id = %schedule.id, error = %e, "host task aborted"),
            }
        }
        // un hôte supprimé pendant l'exécution a pu être re-marqué
        self.inventory.prune_heartbeats();

        let host_results = results.lock().clone();
        let result = aggregate(attempted, succeeded);
        let report = ScheduleReport {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            host_ids,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            elapsed_secs: clock.elapsed().as_secs_f64(),
            host_results,
            result,
        };
        info!(
            schedule_id = %schedule.id,
            ?result,
            succeeded,
            attempted,
            resolved = report.host_ids.len(),
            "schedule run finished"
        );

        if let Err(e) = self.book.mark_run(schedule.id, started_at) {
            warn!(schedule_id = %schedule.id, error = %e, "failed to update last run time");
        }

        let persisted = self.persist_report(report.clone());
        Ok(Some(ScheduleRun { report, persisted }))
    }

    fn persist_report(
        &self,
        report: ScheduleReport,
    ) -> oneshot::Receiver<std::result::Result<(), StoreError>> {
        let (tx, rx) = oneshot::channel();
        let book = self.book.clone();
        tokio::task::spawn_blocking(move || {
            let report_id = report.id;
            let outcome = book.record_report(report);
            if let Err(e) = &outcome {
                error!(%report_id, error = %e, "failed to persist schedule report");
            }
            let _ = tx.send(outcome);
        });
        rx
    }

    /// Déclenchement manuel, sans vérification du motif cron
    pub async fn run_now(&self, schedule_id: ScheduleId) -> Result<Option<ScheduleRun>> {
        let schedule = self.book.schedule(schedule_id)?;
        self.run(&schedule).await
    }

    /// Planifications actives dont le motif correspond à `now`
    pub fn due(&self, now: OffsetDateTime) -> Result<Vec<Schedule>> {
        let due = self
            .book
            .schedules()?
            .into_iter()
            .filter(|s| s.enabled)
            .filter(|s| match s.pattern.parse::<CronPattern>() {
                Ok(pattern) => pattern.matches(now),
                Err(e) => {
                    warn!(schedule = %s.name, error = %e, "invalid stored cron pattern");
                    false
                }
            })
            .collect();
        Ok(due)
    }

    /// Lance les exécutions dues dans `runs`
    pub fn tick(
        self: &Arc<Self>,
        now: OffsetDateTime,
        runs: &mut JoinSet<Result<Option<ScheduleRun>>>,
    ) -> Result<usize> {
        let due = self.due(now)?;
        for schedule in &due {
            let engine = self.clone();
            let schedule = schedule.clone();
            runs.spawn(async move { engine.run(&schedule).await });
        }
        Ok(due.len())
    }

    /// Boucle cron ; ne se termine sur erreur que si elle est fatale
    pub fn spawn_cron_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut runs = JoinSet::new();
            let started = OffsetDateTime::now_utc();
            let mut clock = MinuteClock::starting_at(started);
            let wake = tokio::time::sleep(until_next_minute(started));
            tokio::pin!(wake);
            info!("cron loop started");
            loop {
                tokio::select! {
                    _ = &mut wake => {
                        let now = OffsetDateTime::now_utc();
                        for minute in clock.advance(now) {
                            match self.tick(minute, &mut runs) {
                                Ok(0) => {}
                                Ok(n) => debug!(runs = n, %minute, "cron tick"),
                                Err(e) if e.is_fatal() => return Err(e),
                                Err(e) => warn!(error = %e, %minute, "cron tick failed"),
                            }
                        }
                        wake.as_mut()
                            .reset(tokio::time::Instant::now() + until_next_minute(now));
                    }
                    Some(joined) = runs.join_next() => match joined {
                        Ok(Err(e)) if e.is_fatal() => return Err(e),
                        Ok(Err(e)) => warn!(error = %e, "scheduled run failed"),
                        Ok(Ok(_)) => {}
                        Err(e) => warn!(error = %e, "scheduled run aborted"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!(in_flight = runs.len(), "cron loop stopping, waiting for running schedules");
            while let Some(joined) = runs.join_next().await {
                if let Ok(Err(e)) = joined {
                    warn!(error = %e, "scheduled run failed during shutdown");
                }
            }
            info!("cron loop stopped");
            Ok(())
        })
    }
}

fn until_next_minute(now: OffsetDateTime) -> Duration {
    let into_minute = Duration::from_secs(u64::from(now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond()));
    Duration::from_secs(60).saturating_sub(into_minute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_aggregate() {
        assert_eq!(aggregate(3, 3), ScheduleResult::Success);
        assert_eq!(aggregate(3, 2), ScheduleResult::PartialSuccess);
        assert_eq!(aggregate(3, 0), ScheduleResult::Fail);
        assert_eq!(aggregate(1, 0), ScheduleResult::Fail);
        assert_eq!(aggregate(1, 1), ScheduleResult::Success);
        // aucun hôte contacté : rien n'a échoué
        assert_eq!(aggregate(0, 0), ScheduleResult::Success);
    }

    #[test]
    fn test_minute_clock_ticks_each_minute_once() {
        let mut clock = MinuteClock::starting_at(datetime!(2024-05-01 10:15:30 UTC));
        assert!(clock.advance(datetime!(2024-05-01 10:15:59.999 UTC)).is_empty());
        assert_eq!(
            clock.advance(datetime!(2024-05-01 10:16:00.002 UTC)),
            vec![datetime!(2024-05-01 10:16 UTC)]
        );
        // second réveil dans la même minute
        assert!(clock.advance(datetime!(2024-05-01 10:16:00.5 UTC)).is_empty());
        // réveil tardif : les minutes manquées sont rejouées dans l'ordre
        assert_eq!(
            clock.advance(datetime!(2024-05-01 10:19:02 UTC)),
            vec![
                datetime!(2024-05-01 10:17 UTC),
                datetime!(2024-05-01 10:18 UTC),
                datetime!(2024-05-01 10:19 UTC),
            ]
        );
        // horloge reculée
        assert!(clock.advance(datetime!(2024-05-01 10:18:30 UTC)).is_empty());
        assert!(clock.advance(datetime!(2024-05-01 10:19:40 UTC)).is_empty());
    }

    #[test]
    fn test_minute_clock_caps_catch_up() {
        let mut clock = MinuteClock::starting_at(datetime!(2024-05-01 10:00 UTC));
        let minutes = clock.advance(datetime!(2024-05-01 13:00:05 UTC));
        assert_eq!(minutes.len() as i64, MAX_CATCH_UP_MINUTES);
        assert_eq!(minutes.first(), Some(&datetime!(2024-05-01 12:51 UTC)));
        assert_eq!(minutes.last(), Some(&datetime!(2024-05-01 13:00 UTC)));
    }

    #[test]
    fn test_until_next_minute() {
        assert_eq!(
            until_next_minute(datetime!(2024-05-01 10:15:45 UTC)),
            Duration::from_secs(15)
        );
        assert_eq!(
            until_next_minute(datetime!(2024-05-01 10:15:00 UTC)),
            Duration::from_secs(60)
        );
    }
}
