//! SQLite schema and connection setup.

use rusqlite::Connection;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id          INTEGER PRIMARY KEY,
    version     INTEGER NOT NULL DEFAULT 0,
    payload     BLOB    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'active',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS work_items (
    id                INTEGER PRIMARY KEY,
    queue             TEXT    NOT NULL,
    payload           BLOB    NOT NULL,
    status            TEXT    NOT NULL DEFAULT 'pending'
                      CHECK (status IN ('pending', 'claimed', 'done', 'failed')),
    claimed_by        TEXT,
    claim_expires_at  INTEGER,
    attempts          INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_claim
    ON work_items (queue, status, created_at, id);
"#;

/// Pragmas for every pooled connection.
///
/// WAL lets readers proceed while a claim or batch transaction holds the
/// write lock; `busy_timeout` makes writers queue instead of failing fast.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )
}

/// Create tables and indexes if missing.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}
