use std::sync::{Mutex, MutexGuard};

use cadence_core::{parse_db_timestamp, to_db_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{Task, TaskStatus},
};

const SELECT_TASK: &str = "SELECT id, fire_at, payload, status, created_at, updated_at FROM tasks";

/// Durable key → deferred-task mapping.
///
/// Implementations must make `put` replace-on-conflict so at most one row
/// exists per task id, and must survive process restarts.
pub trait TaskStore: Send + Sync {
    /// Arm (or re-arm) `id` to fire at `fire_at`. Resets the row to `pending`.
    fn put(&self, id: &str, fire_at: DateTime<Utc>, payload: &str) -> Result<Task>;

    /// Delete the task. Returns `false` when no row existed.
    fn remove(&self, id: &str) -> Result<bool>;

    fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Pending tasks whose `fire_at` is at or before `now`, oldest first.
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    fn list_all(&self) -> Result<Vec<Task>>;

    /// Atomically move every due pending task to `running` and return them.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Acknowledge a claimed task. Only a `running` row whose `fire_at` still
    /// equals `fire_at` is marked `fired`; a row re-armed in the meantime is
    /// left pending.
    fn mark_fired(&self, id: &str, fire_at: DateTime<Utc>) -> Result<bool>;

    /// Hand a claimed task back for another attempt at `retry_at`. Only a
    /// `running` row whose `fire_at` still equals `fire_at` is released.
    fn release(&self, id: &str, fire_at: DateTime<Utc>, retry_at: DateTime<Utc>) -> Result<bool>;

    /// Return `running` rows orphaned by a crash to `pending`.
    fn requeue_interrupted(&self) -> Result<usize>;
}

/// SQLite-backed [`TaskStore`].
///
/// Uses its own `Connection` so the engine loop and request paths can share
/// one store without contending on another subsystem's connection.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Unavailable("task store lock poisoned".to_string()))
    }
}

impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, payload), fields(task_id = %id, %fire_at))]
    fn put(&self, id: &str, fire_at: DateTime<Utc>, payload: &str) -> Result<Task> {
        let conn = self.lock()?;
        let now = to_db_timestamp(Utc::now());
        conn.execute(
            "INSERT INTO tasks (id, fire_at, payload, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                fire_at    = excluded.fire_at,
                payload    = excluded.payload,
                status     = 'pending',
                updated_at = excluded.updated_at",
            rusqlite::params![id, to_db_timestamp(fire_at), payload, now],
        )?;
        debug!("task armed");
        get_task(&conn, id)?.ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    fn remove(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if n > 0 {
            debug!("task removed");
        }
        Ok(n > 0)
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        get_task(&conn, id)
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{SELECT_TASK} WHERE status = 'pending' AND fire_at <= ?1 ORDER BY fire_at"
        ))?;
        let rows = stmt.query_map([to_db_timestamp(now)], row_to_task)?;
        let tasks = collect_tasks(rows);
        Ok(tasks)
    }

    fn list_all(&self) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_TASK} ORDER BY fire_at"))?;
        let rows = stmt.query_map([], row_to_task)?;
        let tasks = collect_tasks(rows);
        Ok(tasks)
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut conn = self.lock()?;
        let now_str = to_db_timestamp(now);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Collect eagerly inside the block so `stmt` is dropped before the
        // UPDATEs below borrow `tx` again.
        let due = {
            let mut stmt = tx.prepare_cached(&format!(
                "{SELECT_TASK} WHERE status = 'pending' AND fire_at <= ?1 ORDER BY fire_at"
            ))?;
            let rows = stmt.query_map([&now_str], row_to_task)?;
            let tasks = collect_tasks(rows);
            tasks
        };

        for task in &due {
            tx.execute(
                "UPDATE tasks SET status = 'running', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![now_str, task.id],
            )?;
        }
        tx.commit()?;

        Ok(due
            .into_iter()
            .map(|mut task| {
                task.status = TaskStatus::Running;
                task.updated_at = now_str.clone();
                task
            })
            .collect())
    }

    fn mark_fired(&self, id: &str, fire_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE tasks SET status = 'fired', updated_at = ?1
             WHERE id = ?2 AND status = 'running' AND fire_at = ?3",
            rusqlite::params![to_db_timestamp(Utc::now()), id, to_db_timestamp(fire_at)],
        )?;
        Ok(n > 0)
    }

    #[instrument(skip(self), fields(task_id = %id, %retry_at))]
    fn release(&self, id: &str, fire_at: DateTime<Utc>, retry_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE tasks SET status = 'pending', fire_at = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'running' AND fire_at = ?4",
            rusqlite::params![
                to_db_timestamp(retry_at),
                to_db_timestamp(Utc::now()),
                id,
                to_db_timestamp(fire_at)
            ],
        )?;
        if n > 0 {
            debug!("task released for retry");
        }
        Ok(n > 0)
    }

    fn requeue_interrupted(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE tasks SET status = 'pending', updated_at = ?1 WHERE status = 'running'",
            [to_db_timestamp(Utc::now())],
        )?;
        if n > 0 {
            info!(count = n, "interrupted tasks requeued");
        }
        Ok(n)
    }
}

fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    match conn.query_row(&format!("{SELECT_TASK} WHERE id = ?1"), [id], row_to_task) {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(SchedulerError::Database(e)),
    }
}

/// Keep decodable rows; a corrupt row is logged and skipped so one bad task
/// never blocks the rest of the table.
fn collect_tasks(rows: impl Iterator<Item = rusqlite::Result<Task>>) -> Vec<Task> {
    rows.filter_map(|r| match r {
        Ok(task) => Some(task),
        Err(e) => {
            warn!("skipping undecodable task row: {e}");
            None
        }
    })
    .collect()
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let fire_at: String = row.get(1)?;
    let status: String = row.get(3)?;
    Ok(Task {
        id: row.get(0)?,
        fire_at: parse_db_timestamp(&fire_at)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?,
        payload: row.get(2)?,
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> SqliteTaskStore {
        SqliteTaskStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn put_replaces_existing_task() {
        let store = store();
        let first = Utc::now() + Duration::hours(1);
        let second = Utc::now() + Duration::hours(2);
        store.put("occ-1", first, "{}").unwrap();
        let task = store.put("occ-1", second, r#"{"v":2}"#).unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(to_db_timestamp(task.fire_at), to_db_timestamp(second));
        assert_eq!(store.list_all().unwrap().len(), 1);
        assert_eq!(store.get("occ-1").unwrap().unwrap().payload, r#"{"v":2}"#);
    }

    #[test]
    fn remove_reports_whether_a_row_existed() {
        let store = store();
        store.put("occ-1", Utc::now(), "{}").unwrap();
        assert!(store.remove("occ-1").unwrap());
        assert!(!store.remove("occ-1").unwrap());
        assert!(store.get("occ-1").unwrap().is_none());
    }

    #[test]
    fn list_due_only_returns_pending_tasks_in_the_past() {
        let store = store();
        let now = Utc::now();
        store.put("past", now - Duration::minutes(5), "{}").unwrap();
        store.put("future", now + Duration::minutes(5), "{}").unwrap();

        let due = store.list_due(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "past");
    }

    #[test]
    fn claim_due_moves_tasks_to_running_once() {
        let store = store();
        let now = Utc::now();
        store.put("a", now - Duration::seconds(1), "{}").unwrap();

        let claimed = store.claim_due(now).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, TaskStatus::Running);
        assert!(store.claim_due(now).unwrap().is_empty());
        assert_eq!(store.get("a").unwrap().unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn mark_fired_ignores_rearmed_rows() {
        let store = store();
        let now = Utc::now();
        let old_fire = now - Duration::seconds(1);
        store.put("a", old_fire, "{}").unwrap();
        store.claim_due(now).unwrap();

        // Re-armed while the router was still handling the claimed copy.
        store.put("a", now + Duration::hours(1), "{}").unwrap();
        assert!(!store.mark_fired("a", old_fire).unwrap());
        assert_eq!(store.get("a").unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn mark_fired_acknowledges_claimed_task() {
        let store = store();
        let now = Utc::now();
        let fire_at = now - Duration::seconds(1);
        store.put("a", fire_at, "{}").unwrap();
        store.claim_due(now).unwrap();

        assert!(store.mark_fired("a", fire_at).unwrap());
        let task = store.get("a").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Fired);
        assert!(!task.status.is_live());
    }

    #[test]
    fn release_hands_a_claimed_task_back_for_later() {
        let store = store();
        let now = Utc::now();
        let fire_at = now - Duration::seconds(1);
        let retry_at = now + Duration::seconds(30);
        store.put("a", fire_at, "{}").unwrap();
        store.claim_due(now).unwrap();

        assert!(store.release("a", fire_at, retry_at).unwrap());
        let task = store.get("a").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(to_db_timestamp(task.fire_at), to_db_timestamp(retry_at));
        assert!(store.claim_due(now).unwrap().is_empty());
        assert_eq!(store.claim_due(retry_at).unwrap().len(), 1);

        // Not running any more under the old fire instant.
        assert!(!store.release("a", fire_at, retry_at).unwrap());
    }

    #[test]
    fn requeue_interrupted_returns_running_to_pending() {
        let store = store();
        let now = Utc::now();
        store.put("a", now - Duration::seconds(1), "{}").unwrap();
        store.claim_due(now).unwrap();

        assert_eq!(store.requeue_interrupted().unwrap(), 1);
        assert_eq!(store.list_due(now).unwrap().len(), 1);
    }

    #[test]
    fn tasks_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let fire_at = Utc::now() + Duration::days(1);
        {
            let store = SqliteTaskStore::new(Connection::open(&path).unwrap()).unwrap();
            store.put("occ-7", fire_at, r#"{"owner_id":"o"}"#).unwrap();
        }
        let store = SqliteTaskStore::new(Connection::open(&path).unwrap()).unwrap();
        let task = store.get("occ-7").unwrap().expect("task persisted");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(to_db_timestamp(task.fire_at), to_db_timestamp(fire_at));
    }
}
