//! SQLite schema and migrations for the tool index store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Whether the schema has been applied to this connection.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='tools'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for read-mostly concurrent access
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // Minimal tool entries; the full spec rides in a lazily-read JSON column
    // so retrieval queries never touch it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tools (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            desc_short TEXT NOT NULL,
            platform TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            cost_hint TEXT NOT NULL DEFAULT 'low',
            embedding BLOB NOT NULL,
            always_include INTEGER NOT NULL DEFAULT 0,
            full_spec TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tools_name ON tools(name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tools_platform ON tools(platform)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tools_updated_at ON tools(updated_at)",
        [],
    )?;

    // One row per selector request
    conn.execute(
        "CREATE TABLE IF NOT EXISTS selector_telemetry (
            request_id TEXT PRIMARY KEY,
            catalog_size INTEGER NOT NULL,
            candidates_before_budget INTEGER NOT NULL,
            rows_sent INTEGER NOT NULL,
            budget_used_tokens INTEGER NOT NULL,
            headroom_left_pct REAL NOT NULL,
            pool_ids TEXT NOT NULL DEFAULT '[]',
            selected_ids TEXT NOT NULL DEFAULT '[]',
            executed_ids TEXT NOT NULL DEFAULT '[]',
            recall_at_k REAL,
            truncation_events INTEGER NOT NULL DEFAULT 0,
            budget_clamped INTEGER NOT NULL DEFAULT 0,
            tie_break_attempted INTEGER NOT NULL DEFAULT 0,
            stage_timings TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_telemetry_created_at
         ON selector_telemetry(created_at)",
        [],
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes_once() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!is_initialized(&conn));
        initialize_schema(&conn).unwrap();
        assert!(is_initialized(&conn));
        // Idempotent
        initialize_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
