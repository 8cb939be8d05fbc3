//! Dimension resolution: crops, soil types and growth stages
//!
//! Dimension rows are created on first reference. Resolution is an
//! insert-or-fetch: look the name up, otherwise insert it under the UNIQUE
//! constraint, and on a uniqueness conflict re-fetch the row that won.
//! Concurrent resolvers of the same name therefore converge on one id.

use std::fmt;
use std::str::FromStr;

use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{is_constraint, is_foreign_key_violation, is_transient, StorageError};

/// Identifier of a crop, soil type or growth stage row
pub type DimensionId = i64;

/// Default bound on fetch-or-create attempts
pub const DEFAULT_MAX_RESOLVE_ATTEMPTS: u32 = 3;

/// The three categorical dimensions of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Crop,
    Soil,
    Stage,
}

impl DimensionKind {
    /// Backing table
    pub fn table(self) -> &'static str {
        match self {
            DimensionKind::Crop => "crops",
            DimensionKind::Soil => "soil_types",
            DimensionKind::Stage => "growth_stages",
        }
    }

    /// Column of `observations` that references this dimension
    pub fn reference_column(self) -> &'static str {
        match self {
            DimensionKind::Crop => "crop_id",
            DimensionKind::Soil => "soil_id",
            DimensionKind::Stage => "stage_id",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DimensionKind::Crop => "crop",
            DimensionKind::Soil => "soil",
            DimensionKind::Stage => "stage",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DimensionKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crop" | "crops" => Ok(DimensionKind::Crop),
            "soil" | "soils" | "soil_type" | "soil_types" => Ok(DimensionKind::Soil),
            "stage" | "stages" | "growth_stage" | "growth_stages" => Ok(DimensionKind::Stage),
            other => Err(StorageError::InvalidInput(format!("unknown dimension kind '{}'", other))),
        }
    }
}

/// Dimension row from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRow {
    pub id: DimensionId,
    pub name: String,
}

impl DimensionRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }
}

/// Trim a dimension name, rejecting names that are empty afterwards
pub fn normalize_name(kind: DimensionKind, raw: &str) -> Result<&str, StorageError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(StorageError::InvalidInput(format!("{} name must not be empty", kind)));
    }
    Ok(name)
}

fn lookup(conn: &Connection, kind: DimensionKind, name: &str) -> Result<Option<DimensionId>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT id FROM {} WHERE name = ?", kind.table()),
        params![name],
        |row| row.get(0),
    )
    .optional()
}

/// Find a dimension id by exact (trimmed) name
pub fn find_by_name(conn: &Connection, kind: DimensionKind, name: &str) -> Result<Option<DimensionId>, StorageError> {
    let name = normalize_name(kind, name)?;
    lookup(conn, kind, name).map_err(StorageError::storage(format!("Lookup of {} failed", kind)))
}

/// Resolve a name to its dimension id, creating the row if absent.
///
/// Lock contention, or a conflict whose winner cannot be re-fetched, restarts
/// the fetch-or-create sequence. After `max_attempts` such restarts the call
/// fails with `ConflictRetryExhausted`.
pub fn resolve(
    conn: &Connection,
    kind: DimensionKind,
    name: &str,
    max_attempts: u32,
) -> Result<DimensionId, StorageError> {
    let name = normalize_name(kind, name)?;
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match lookup(conn, kind, name) {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => {}
            Err(e) if is_transient(&e) => {
                debug!(%kind, name, attempt, "Lookup hit lock contention, retrying");
                continue;
            }
            Err(e) => return Err(StorageError::storage(format!("Lookup of {} failed", kind))(e)),
        }

        match create_or_fetch(conn, kind, name) {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => debug!(%kind, name, attempt, "Conflicting row vanished, retrying"),
            Err(e) if is_transient(&e) => debug!(%kind, name, attempt, "Create hit lock contention, retrying"),
            Err(e) => return Err(StorageError::storage(format!("Create of {} failed", kind))(e)),
        }
    }

    warn!(%kind, name, attempts = max_attempts, "Dimension resolution did not converge");
    Err(StorageError::ConflictRetryExhausted {
        kind,
        name: name.to_string(),
        attempts: max_attempts,
    })
}

/// Insert `name`, or on a uniqueness conflict fetch the row that won.
///
/// `Ok(None)` means the conflicting row was gone again by the re-fetch.
fn create_or_fetch(conn: &Connection, kind: DimensionKind, name: &str) -> Result<Option<DimensionId>, rusqlite::Error> {
    let inserted = conn.execute(
        &format!("INSERT INTO {} (name) VALUES (?)", kind.table()),
        params![name],
    );

    match inserted {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            info!(%kind, name, id, "Created dimension row");
            Ok(Some(id))
        }
        Err(e) if is_constraint(&e, ffi::SQLITE_CONSTRAINT_UNIQUE) => {
            // Another writer created the same name first
            let existing = lookup(conn, kind, name)?;
            if let Some(id) = existing {
                debug!(%kind, name, id, "Lost create race, using existing row");
            }
            Ok(existing)
        }
        Err(e) => Err(e),
    }
}

/// Whether a dimension row with this id exists
pub fn exists(conn: &Connection, kind: DimensionKind, id: DimensionId) -> Result<bool, StorageError> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?", kind.table()),
        params![id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(StorageError::storage(format!("Existence check of {} failed", kind)))
}

/// List all rows of a dimension, ordered by name
pub fn list_dimensions(conn: &Connection, kind: DimensionKind) -> Result<Vec<DimensionRow>, StorageError> {
    let mut stmt = conn
        .prepare(&format!("SELECT id, name FROM {} ORDER BY name", kind.table()))
        .map_err(StorageError::storage("Prepare failed"))?;

    let rows = stmt
        .query_map([], DimensionRow::from_row)
        .map_err(StorageError::storage("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StorageError::storage("Row parse failed"))?;

    Ok(rows)
}

/// Delete a dimension row by name.
///
/// Rows still referenced by an observation are rejected with
/// `ReferentialIntegrity`. Returns false when no row has that name.
pub fn delete_dimension(conn: &Connection, kind: DimensionKind, name: &str) -> Result<bool, StorageError> {
    let name = normalize_name(kind, name)?;

    let Some(id) = lookup(conn, kind, name).map_err(StorageError::storage(format!("Lookup of {} failed", kind)))? else {
        return Ok(false);
    };

    let referenced: bool = conn
        .query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM observations WHERE {} = ?)", kind.reference_column()),
            params![id],
            |row| row.get(0),
        )
        .map_err(StorageError::storage(format!("Reference check of {} failed", kind)))?;

    if referenced {
        return Err(referenced_error(kind, name));
    }

    match conn.execute(&format!("DELETE FROM {} WHERE id = ?", kind.table()), params![id]) {
        Ok(changes) => {
            if changes > 0 {
                info!(%kind, name, id, "Deleted dimension row");
            }
            Ok(changes > 0)
        }
        // A reference committed between the check and the delete
        Err(e) if is_foreign_key_violation(&e) => Err(referenced_error(kind, name)),
        Err(e) => Err(StorageError::storage(format!("Delete of {} failed", kind))(e)),
    }
}

fn referenced_error(kind: DimensionKind, name: &str) -> StorageError {
    StorageError::ReferentialIntegrity(format!("{} '{}' is referenced by observations", kind, name))
}
