//! SQLite database module for crop observations
//!
//! ## Tables
//!
//! - `crops`, `soil_types`, `growth_stages` - Dimension rows, unique by name,
//!   created lazily on first reference
//! - `observations` - Sensor readings referencing one row of each dimension
//! - `audit_entries` - Append-only log of every observation mutation
//!
//! Dimension rows referenced by an observation cannot be deleted (foreign keys
//! use `ON DELETE RESTRICT`). Audit rows cannot be updated or deleted (guarded
//! by triggers).

pub mod schema;
pub mod dimensions;
pub mod observations;
pub mod audit;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StorageError;

/// Default time a connection waits on a locked database before giving up
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// SQLite database for observations, dimensions and the audit log
pub struct ObservationDb {
    conn: Mutex<Connection>,
}

impl ObservationDb {
    /// Open or create the observation database at `db_path`
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self, StorageError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(StorageError::storage("Failed to open SQLite"))?;

        conn.busy_timeout(busy_timeout)
            .map_err(StorageError::storage("Failed to set busy timeout"))?;

        // WAL lets readers proceed while an ingestion holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(StorageError::storage("Failed to set PRAGMA"))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(StorageError::storage("Failed to open in-memory SQLite"))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        // Foreign key enforcement is per-connection in SQLite
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(StorageError::storage("Failed to enable foreign keys"))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        schema::init_schema(&conn)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Run a read operation against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self.lock()?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, StorageError> {
                let n: i64 = conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                    .map_err(StorageError::storage(format!("Count of {} failed", table)))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                crop_count: count("crops")?,
                soil_type_count: count("soil_types")?,
                growth_stage_count: count("growth_stages")?,
                observation_count: count("observations")?,
                audit_entry_count: count("audit_entries")?,
            })
        })
    }
}

/// Current UTC time as stored in timestamp columns (RFC 3339, microseconds)
pub(crate) fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Database statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DbStats {
    pub crop_count: u64,
    pub soil_type_count: u64,
    pub growth_stage_count: u64,
    pub observation_count: u64,
    pub audit_entry_count: u64,
}

// Re-exports
pub use audit::{AuditAction, AuditEntry};
pub use dimensions::{DimensionId, DimensionKind, DimensionRow};
pub use observations::{NewObservation, ObservationId, ObservationQuery, ObservationRow, ObservationValues};
