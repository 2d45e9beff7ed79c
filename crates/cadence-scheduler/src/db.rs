use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` table (idempotent) and an index on `(status, fire_at)`
/// so the polling query stays cheap with many armed tasks.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id          TEXT    NOT NULL PRIMARY KEY,
            fire_at     TEXT    NOT NULL,   -- fixed-width RFC 3339, UTC
            payload     TEXT    NOT NULL,   -- opaque JSON payload
            status      TEXT    NOT NULL DEFAULT 'pending',
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        -- Efficient polling: SELECT … WHERE status = 'pending' AND fire_at <= ?
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, fire_at);
        ",
    )?;
    Ok(())
}
