use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{error::Result, store::TaskStore, types::Task};

/// Background loop that turns due tasks into messages on the fired channel.
///
/// The engine never executes a task itself. Claimed tasks are forwarded to
/// the router, which applies the effect and acknowledges with
/// [`TaskStore::mark_fired`]. A crash between claim and acknowledgement
/// leaves the row `running`; the next start requeues it.
pub struct SchedulerEngine {
    store: Arc<dyn TaskStore>,
    fired_tx: mpsc::Sender<Task>,
    poll_interval: Duration,
}

impl SchedulerEngine {
    pub fn new(store: Arc<dyn TaskStore>, fired_tx: mpsc::Sender<Task>, poll_interval: Duration) -> Self {
        Self {
            store,
            fired_tx,
            poll_interval,
        }
    }

    /// Main event loop. Polls every `poll_interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "scheduler engine started");
        if let Err(e) = self.store.requeue_interrupted() {
            error!("requeue-on-startup failed: {e}");
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(n) => debug!(count = n, "tasks forwarded"),
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim every due task and forward it to the router.
    ///
    /// Returns how many tasks were forwarded. A closed channel stops the pass;
    /// the unforwarded tasks stay `running` and are requeued on next start.
    pub async fn tick(&self) -> Result<usize> {
        let due = self.store.claim_due(Utc::now())?;
        let mut forwarded = 0;
        for task in due {
            let task_id = task.id.clone();
            if self.fired_tx.send(task).await.is_err() {
                warn!(task_id = %task_id, "fired-task channel closed, task left for requeue");
                break;
            }
            forwarded += 1;
        }
        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteTaskStore;
    use crate::types::TaskStatus;
    use rusqlite::Connection;

    fn store() -> Arc<SqliteTaskStore> {
        Arc::new(SqliteTaskStore::new(Connection::open_in_memory().unwrap()).unwrap())
    }

    #[tokio::test]
    async fn tick_forwards_due_tasks_only() {
        let store = store();
        let now = Utc::now();
        store.put("due", now - chrono::Duration::seconds(5), "{}").unwrap();
        store.put("later", now + chrono::Duration::hours(1), "{}").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let engine = SchedulerEngine::new(store.clone(), tx, Duration::from_millis(10));

        assert_eq!(engine.tick().await.unwrap(), 1);
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.id, "due");
        assert_eq!(fired.status, TaskStatus::Running);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let store = store();
        store.put("due", Utc::now() - chrono::Duration::seconds(1), "{}").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = SchedulerEngine::new(store, tx, Duration::from_millis(10));
        let handle = tokio::spawn(engine.run(shutdown_rx));

        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("task fired in time")
            .expect("channel open");
        assert_eq!(fired.id, "due");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("engine stopped")
            .unwrap();
    }
}
