//! SQLite schema for the persistent CS backend.

use rusqlite::{Connection, OptionalExtension};

use crate::errors::{SyncError, SyncResult};

/// Layout version stamped into `cs_meta`. A store stamped with a later
/// version was written by a newer release and is refused.
pub const SCHEMA_VERSION: i32 = 1;

/// Executed with `IF NOT EXISTS` so replaying on an initialised database
/// is harmless.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cs_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS cs_options (
        path TEXT PRIMARY KEY,
        section TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE INDEX IF NOT EXISTS idx_cs_options_section ON cs_options(section);",
    "CREATE TABLE IF NOT EXISTS commit_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mutation_count INTEGER NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

/// Create the tables and stamp or check the layout version.
pub fn initialize(conn: &Connection) -> SyncResult<()> {
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    match get_schema_version(conn)? {
        None => {
            conn.execute(
                "INSERT INTO cs_meta(key, value) VALUES('schema_version', ?1);",
                rusqlite::params![SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(version) if version <= SCHEMA_VERSION => Ok(()),
        Some(version) => Err(SyncError::Store(format!(
            "CS database has schema version {version}, \
             this build understands up to {SCHEMA_VERSION}"
        ))),
    }
}

/// Stamped layout version, `None` for a fresh database.
pub fn get_schema_version(conn: &Connection) -> SyncResult<Option<i32>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM cs_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|v| {
        v.trim()
            .parse::<i32>()
            .map_err(|_| SyncError::Store(format!("unreadable CS schema version {v:?}")))
    })
    .transpose()
}
