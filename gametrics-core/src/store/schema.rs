//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: pending queue + dead letters
    r#"
    -- One row per not-yet-delivered event. The rowid is the sequence id:
    -- drain order and delete targeting both key off it. app_key and secret
    -- are captured per row so a key rotation mid-queue still delivers each
    -- event under the key it was recorded with.
    CREATE TABLE IF NOT EXISTS pending_events (
        id                INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        category          TEXT NOT NULL,
        app_key           TEXT NOT NULL,
        secret            TEXT NOT NULL,

        -- Envelope
        user_id           TEXT NOT NULL,
        session_id        TEXT NOT NULL,
        build             TEXT NOT NULL,
        event_id          TEXT NOT NULL,
        area              TEXT NOT NULL,
        x                 REAL NOT NULL DEFAULT 0,
        y                 REAL NOT NULL DEFAULT 0,
        z                 REAL NOT NULL DEFAULT 0,

        -- Design
        value             REAL,

        -- Business
        currency          TEXT,
        amount            INTEGER,

        -- User
        gender            TEXT,
        birth_year        INTEGER,
        friend_count      INTEGER,
        platform          TEXT,
        device            TEXT,
        os_major          TEXT,
        os_minor          TEXT,
        sdk_version       TEXT,
        install_publisher TEXT,
        install_site      TEXT,
        install_campaign  TEXT,
        install_ad        TEXT,
        install_keyword   TEXT,
        android_id        TEXT,

        -- Quality
        message           TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_pending_category ON pending_events(category, app_key);

    -- Batches the collector rejected permanently (4xx). Kept for diagnosis
    -- instead of being retried forever.
    CREATE TABLE IF NOT EXISTS dead_events (
        id           INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        pending_id   INTEGER NOT NULL,
        category     TEXT NOT NULL,
        app_key      TEXT NOT NULL,
        http_status  INTEGER NOT NULL,
        dead_at      DATETIME NOT NULL,
        payload      JSON NOT NULL
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running event store migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
