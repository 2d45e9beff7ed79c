use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Open a file-backed connection with WAL and a busy timeout, so several
/// connections can share the database file.
pub fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")?;
    Ok(conn)
}

/// Initialise the bookings schema in `conn`.
///
/// Idempotent. Every store calls it on construction, so any store can be
/// opened on its own connection.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS patterns (
            id           TEXT    NOT NULL PRIMARY KEY,
            owner_id     TEXT    NOT NULL,
            resource_id  TEXT    NOT NULL,
            client_id    TEXT    NOT NULL,
            frequency    TEXT    NOT NULL,
            start_date   TEXT    NOT NULL,   -- YYYY-MM-DD
            end_date     TEXT,               -- NULL = open-ended
            title        TEXT,
            start_time   TEXT    NOT NULL,   -- HH:MM, UTC
            end_time     TEXT    NOT NULL,
            hourly_rate  REAL    NOT NULL,
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_patterns_owner ON patterns (owner_id);

        CREATE TABLE IF NOT EXISTS meetings (
            id           TEXT    NOT NULL PRIMARY KEY,
            owner_id     TEXT    NOT NULL,
            pattern_id   TEXT,
            client_id    TEXT    NOT NULL,
            resource_id  TEXT    NOT NULL,
            quota_id     TEXT,
            title        TEXT,
            start_at     TEXT    NOT NULL,   -- fixed-width RFC 3339, UTC
            end_at       TEXT    NOT NULL,
            hourly_rate  REAL    NOT NULL,
            total_price  REAL    NOT NULL,
            status       TEXT    NOT NULL DEFAULT 'upcoming',
            paid         INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_meetings_owner_start ON meetings (owner_id, start_at);
        CREATE INDEX IF NOT EXISTS idx_meetings_pattern ON meetings (pattern_id, start_at);
        CREATE INDEX IF NOT EXISTS idx_meetings_quota ON meetings (quota_id, status);
        -- Startup recovery scans every upcoming row.
        CREATE INDEX IF NOT EXISTS idx_meetings_status ON meetings (status, end_at);

        CREATE TABLE IF NOT EXISTS quotas (
            id                TEXT    NOT NULL PRIMARY KEY,
            owner_id          TEXT    NOT NULL,
            client_id         TEXT    NOT NULL,
            name              TEXT    NOT NULL,
            total_credits     INTEGER NOT NULL,
            total_price       REAL    NOT NULL,
            price_per_credit  REAL    NOT NULL,
            validity_days     INTEGER NOT NULL,
            activated_at      TEXT,
            status            TEXT    NOT NULL DEFAULT 'active',
            paid              INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_quotas_client ON quotas (owner_id, client_id, status);
        ",
    )?;
    Ok(())
}
