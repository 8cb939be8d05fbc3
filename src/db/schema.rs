//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    ).map_err(StorageError::storage("Failed to create schema_version table"))?;

    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .map_err(StorageError::storage("Failed to read schema_version"))?;

    Ok(version.unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(StorageError::storage("Failed to clear schema_version"))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(StorageError::storage("Failed to set schema_version"))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(DIMENSIONS_SCHEMA)
        .map_err(StorageError::storage("Failed to create dimension tables"))?;

    conn.execute_batch(OBSERVATIONS_SCHEMA)
        .map_err(StorageError::storage("Failed to create observation tables"))?;

    conn.execute_batch(AUDIT_SCHEMA)
        .map_err(StorageError::storage("Failed to create audit tables"))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(StorageError::storage("Failed to create indexes"))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StorageError> {
    // v1 is the first released layout; later steps go here keyed on from_version
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Dimension tables: one row per distinct name
const DIMENSIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS crops (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0)
);

CREATE TABLE IF NOT EXISTS soil_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0)
);

CREATE TABLE IF NOT EXISTS growth_stages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0)
);
"#;

/// Observation table
const OBSERVATIONS_SCHEMA: &str = r#"
-- AUTOINCREMENT so a deleted observation id is never handed out again;
-- audit entries keep pointing at it
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    crop_id INTEGER NOT NULL REFERENCES crops(id) ON DELETE RESTRICT,
    soil_id INTEGER NOT NULL REFERENCES soil_types(id) ON DELETE RESTRICT,
    stage_id INTEGER NOT NULL REFERENCES growth_stages(id) ON DELETE RESTRICT,

    moisture REAL NOT NULL CHECK (moisture >= 0),
    temperature REAL NOT NULL CHECK (temperature BETWEEN -50 AND 80),
    humidity REAL NOT NULL CHECK (humidity BETWEEN 0 AND 100),
    result INTEGER,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Audit log table and the triggers that keep it append-only
const AUDIT_SCHEMA: &str = r#"
-- observation_id is not a foreign key: entries outlive the
-- observation they describe
CREATE TABLE IF NOT EXISTS audit_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    observation_id INTEGER,
    action TEXT NOT NULL CHECK (action IN ('Created', 'Updated', 'Deleted')),
    occurred_at TEXT NOT NULL,
    changed_data TEXT NOT NULL,
    actor TEXT
);

CREATE TRIGGER IF NOT EXISTS audit_entries_no_update
BEFORE UPDATE ON audit_entries
BEGIN
    SELECT RAISE(ABORT, 'audit entries are append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_entries_no_delete
BEFORE DELETE ON audit_entries
BEGIN
    SELECT RAISE(ABORT, 'audit entries are append-only');
END;
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_observations_crop_id ON observations(crop_id);
CREATE INDEX IF NOT EXISTS idx_observations_soil_id ON observations(soil_id);
CREATE INDEX IF NOT EXISTS idx_observations_stage_id ON observations(stage_id);
CREATE INDEX IF NOT EXISTS idx_observations_created_at ON observations(created_at);

CREATE INDEX IF NOT EXISTS idx_audit_entries_observation_id ON audit_entries(observation_id);
CREATE INDEX IF NOT EXISTS idx_audit_entries_occurred_at ON audit_entries(occurred_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_init_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in ["audit_entries", "crops", "growth_stages", "observations", "schema_version", "soil_types"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_audit_rows_reject_update_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO audit_entries (observation_id, action, occurred_at, changed_data, actor)
             VALUES (1, 'Created', '2026-01-01T00:00:00Z', '{}', NULL)",
            [],
        ).unwrap();

        assert!(conn.execute("UPDATE audit_entries SET actor = 'x'", []).is_err());
        assert!(conn.execute("DELETE FROM audit_entries", []).is_err());

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_humidity_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO crops (name) VALUES ('Maize');
             INSERT INTO soil_types (name) VALUES ('Loam');
             INSERT INTO growth_stages (name) VALUES ('Seedling');",
        ).unwrap();

        let result = conn.execute(
            "INSERT INTO observations (crop_id, soil_id, stage_id, moisture, temperature, humidity, created_at, updated_at)
             VALUES (1, 1, 1, 1.0, 20.0, 150.0, 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
