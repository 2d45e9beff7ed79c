//! Background tasks spawned by `cadenced run`.

use std::sync::Arc;
use std::time::Duration;

use cadence_bookings::FireOutcome;
use cadence_scheduler::{Task, TaskStore};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::App;

/// Apply fired transition tasks until the engine drops its sender.
pub fn spawn_fired_router(app: Arc<App>, mut fired_rx: mpsc::Receiver<Task>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(task) = fired_rx.recv().await {
            route_fired(&app, &task);
        }
        debug!("fired-task router stopped");
    })
}

pub fn route_fired(app: &App, task: &Task) -> Option<FireOutcome> {
    match app.service.handle_fired(task) {
        Ok(outcome) => {
            debug!(task_id = %task.id, ?outcome, "transition task handled");
            Some(outcome)
        }
        Err(e) if e.is_retryable() => {
            let delay = app.config.scheduler.retry_delay_secs;
            let retry_at = Utc::now() + ChronoDuration::seconds(delay as i64);
            warn!(task_id = %task.id, "transition task failed, retrying in {delay}s: {e}");
            if let Err(e) = app.tasks.release(&task.id, task.fire_at, retry_at) {
                // Still `running`; requeued on next start.
                warn!(task_id = %task.id, "failed to release task: {e}");
            }
            None
        }
        Err(e) => {
            warn!(task_id = %task.id, "dropping transition task: {e}");
            if let Err(e) = app.tasks.mark_fired(&task.id, task.fire_at) {
                warn!(task_id = %task.id, "failed to acknowledge task: {e}");
            }
            None
        }
    }
}

/// Expire spent quotas every `period` until shutdown.
pub fn spawn_quota_sweep(
    app: Arc<App>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match app.service.sweep_expired_quotas() {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "quota sweep expired quotas"),
                        Err(e) => warn!("quota sweep failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("quota sweep stopped");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_bookings::{
        BookingError, MeetingStatus, Occurrence, OccurrenceDraft, OccurrenceFilter,
        OccurrencePatch, OccurrenceStore, QuotaUsage, Result as BookingResult, Stores,
    };
    use cadence_core::{CadenceConfig, OwnerId};
    use cadence_scheduler::{SchedulerEngine, SqliteTaskStore, TaskStatus};
    use rusqlite::Connection;

    /// Occurrence store whose reads fail like a locked database.
    struct LockedOccurrences(Arc<dyn OccurrenceStore>);

    fn locked() -> BookingError {
        BookingError::TransientStore("database is locked".into())
    }

    impl OccurrenceStore for LockedOccurrences {
        fn list(&self, _filter: &OccurrenceFilter) -> BookingResult<Vec<Occurrence>> {
            Err(locked())
        }
        fn get(&self, _owner: &OwnerId, _id: &str) -> BookingResult<Option<Occurrence>> {
            Err(locked())
        }
        fn create(&self, owner: &OwnerId, draft: &OccurrenceDraft) -> BookingResult<Occurrence> {
            self.0.create(owner, draft)
        }
        fn update(
            &self,
            _owner: &OwnerId,
            _id: &str,
            _patch: &OccurrencePatch,
        ) -> BookingResult<Option<Occurrence>> {
            Err(locked())
        }
        fn delete(&self, _owner: &OwnerId, _id: &str) -> BookingResult<bool> {
            Err(locked())
        }
        fn complete_if_upcoming(&self, _owner: &OwnerId, _id: &str) -> BookingResult<bool> {
            Err(locked())
        }
        fn quota_usage(&self, owner: &OwnerId, quota_id: &str) -> BookingResult<QuotaUsage> {
            self.0.quota_usage(owner, quota_id)
        }
    }

    fn app() -> Arc<App> {
        let stores = Stores::in_memory().unwrap();
        let tasks = Arc::new(SqliteTaskStore::new(Connection::open_in_memory().unwrap()).unwrap());
        Arc::new(App::from_parts(CadenceConfig::default(), stores, tasks))
    }

    fn ended_occurrence(app: &App, owner: &OwnerId) -> String {
        let end = Utc::now() - ChronoDuration::seconds(1);
        app.service
            .create_occurrence(
                owner,
                &OccurrenceDraft {
                    pattern_id: None,
                    client_id: "c".into(),
                    resource_id: "r".into(),
                    quota_id: None,
                    title: Some("Call".into()),
                    start: end - ChronoDuration::minutes(30),
                    end,
                    hourly_rate: 100.0,
                    status: MeetingStatus::Upcoming,
                    paid: false,
                },
            )
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn engine_and_router_complete_an_ended_occurrence() {
        let app = app();
        let owner = OwnerId::new();
        let id = ended_occurrence(&app, &owner);

        let (fired_tx, fired_rx) = mpsc::channel(8);
        let engine = SchedulerEngine::new(app.tasks.clone(), fired_tx, Duration::from_millis(10));
        assert_eq!(engine.tick().await.unwrap(), 1);
        drop(engine);

        spawn_fired_router(app.clone(), fired_rx).await.unwrap();

        let occ = app.service.get_occurrence(&owner, &id).unwrap();
        assert_eq!(occ.status, MeetingStatus::Done);
        assert_eq!(app.tasks.get(&id).unwrap().unwrap().status, TaskStatus::Fired);
    }

    #[test]
    fn malformed_task_is_acknowledged_and_dropped() {
        let app = app();
        app.tasks.put("junk", Utc::now(), "not json").unwrap();
        let claimed = app.tasks.claim_due(Utc::now()).unwrap();
        assert_eq!(route_fired(&app, &claimed[0]), None);
        assert_eq!(app.tasks.get("junk").unwrap().unwrap().status, TaskStatus::Fired);
    }

    #[tokio::test]
    async fn quota_sweep_stops_on_shutdown() {
        let app = app();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_quota_sweep(app, Duration::from_millis(5), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn transient_failure_releases_the_task_for_retry() {
        let stores = Stores::in_memory().unwrap();
        let tasks = Arc::new(SqliteTaskStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let healthy = App::from_parts(CadenceConfig::default(), stores.clone(), tasks.clone());
        let owner = OwnerId::new();
        let id = ended_occurrence(&healthy, &owner);

        let locked_stores = Stores {
            occurrences: Arc::new(LockedOccurrences(stores.occurrences.clone())),
            ..stores
        };
        let flaky = App::from_parts(CadenceConfig::default(), locked_stores, tasks);

        let now = Utc::now();
        let claimed = flaky.tasks.claim_due(now).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(route_fired(&flaky, &claimed[0]), None);

        let task = flaky.tasks.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.fire_at > now);

        // Once the store recovers the retried task completes the occurrence.
        let retried = healthy.tasks.claim_due(task.fire_at).unwrap();
        assert_eq!(route_fired(&healthy, &retried[0]), Some(FireOutcome::Completed));
        let occ = healthy.service.get_occurrence(&owner, &id).unwrap();
        assert_eq!(occ.status, MeetingStatus::Done);
    }
}
