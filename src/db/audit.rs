//! Append-only audit log of observation mutations
//!
//! Every insert, update and delete of an observation writes exactly one entry
//! on the same transaction as the mutation itself. Entries are never updated
//! or removed; the schema triggers reject both.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::observations::{ObservationId, ObservationRow};
use super::timestamp_now;
use crate::error::StorageError;

/// Kind of mutation an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Created,
    Updated,
    Deleted,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Created => "Created",
            AuditAction::Updated => "Updated",
            AuditAction::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for AuditAction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AuditAction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "Created" => Ok(AuditAction::Created),
            "Updated" => Ok(AuditAction::Updated),
            "Deleted" => Ok(AuditAction::Deleted),
            other => Err(FromSqlError::Other(format!("unknown audit action '{}'", other).into())),
        }
    }
}

/// Audit entry row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub observation_id: Option<ObservationId>,
    pub action: AuditAction,
    pub occurred_at: String,
    pub changed_data: Value,
    pub actor: Option<String>,
}

impl AuditEntry {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            observation_id: row.get("observation_id")?,
            action: row.get("action")?,
            occurred_at: row.get("occurred_at")?,
            changed_data: row.get("changed_data")?,
            actor: row.get("actor")?,
        })
    }
}

/// Build the `changed_data` payload for a mutation.
///
/// Created entries carry `after`, deleted entries carry `before`, updates
/// carry both. Each snapshot is the full observation row with dimension names.
pub fn change_payload(
    before: Option<&ObservationRow>,
    after: Option<&ObservationRow>,
) -> Result<Value, StorageError> {
    let mut payload = Map::new();
    if let Some(before) = before {
        payload.insert("before".to_string(), serde_json::to_value(before)?);
    }
    if let Some(after) = after {
        payload.insert("after".to_string(), serde_json::to_value(after)?);
    }
    Ok(Value::Object(payload))
}

/// Append one audit entry
pub fn record(
    conn: &Connection,
    observation_id: Option<ObservationId>,
    action: AuditAction,
    changed_data: &Value,
    actor: Option<&str>,
) -> Result<AuditEntry, StorageError> {
    let occurred_at = timestamp_now();

    conn.execute(
        r#"
        INSERT INTO audit_entries (observation_id, action, occurred_at, changed_data, actor)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![observation_id, action, occurred_at, changed_data, actor],
    ).map_err(StorageError::storage("Audit insert failed"))?;

    let id = conn.last_insert_rowid();
    debug!(audit_id = id, ?observation_id, %action, "Recorded audit entry");

    Ok(AuditEntry {
        id,
        observation_id,
        action,
        occurred_at,
        changed_data: changed_data.clone(),
        actor: actor.map(str::to_string),
    })
}

/// All entries for one observation, oldest first
pub fn audit_trail(conn: &Connection, observation_id: ObservationId) -> Result<Vec<AuditEntry>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT * FROM audit_entries WHERE observation_id = ? ORDER BY id ASC")
        .map_err(StorageError::storage("Prepare failed"))?;

    let entries = stmt
        .query_map(params![observation_id], AuditEntry::from_row)
        .map_err(StorageError::storage("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StorageError::storage("Row parse failed"))?;

    Ok(entries)
}

/// Most recent entries across all observations, newest first
pub fn recent_audit(conn: &Connection, limit: u32) -> Result<Vec<AuditEntry>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT * FROM audit_entries ORDER BY id DESC LIMIT ?")
        .map_err(StorageError::storage("Prepare failed"))?;

    let entries = stmt
        .query_map(params![limit as i64], AuditEntry::from_row)
        .map_err(StorageError::storage("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StorageError::storage("Row parse failed"))?;

    Ok(entries)
}
