//! Observation CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::dimensions::{self, DimensionId, DimensionKind};
use super::timestamp_now;
use crate::error::{is_foreign_key_violation, StorageError};

/// Identifier of an observation row
pub type ObservationId = i64;

/// Measured values of one sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationValues {
    pub moisture: f64,
    pub temperature: f64,
    pub humidity: f64,
    /// Opaque outcome code, no ordering implied
    #[serde(default)]
    pub result: Option<i32>,
}

/// Fully resolved observation ready to be written
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewObservation {
    pub crop_id: DimensionId,
    pub soil_id: DimensionId,
    pub stage_id: DimensionId,
    pub values: ObservationValues,
}

/// Observation row joined with its dimension names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub id: ObservationId,
    pub crop_id: DimensionId,
    pub crop_name: String,
    pub soil_id: DimensionId,
    pub soil_name: String,
    pub stage_id: DimensionId,
    pub stage_name: String,
    pub moisture: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub result: Option<i32>,
    pub created_at: String,
    pub updated_at: String,
}

impl ObservationRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            crop_id: row.get("crop_id")?,
            crop_name: row.get("crop_name")?,
            soil_id: row.get("soil_id")?,
            soil_name: row.get("soil_name")?,
            stage_id: row.get("stage_id")?,
            stage_name: row.get("stage_name")?,
            moisture: row.get("moisture")?,
            temperature: row.get("temperature")?,
            humidity: row.get("humidity")?,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// The measured values of this row
    pub fn values(&self) -> ObservationValues {
        ObservationValues {
            moisture: self.moisture,
            temperature: self.temperature,
            humidity: self.humidity,
            result: self.result,
        }
    }
}

/// Query parameters for listing observations
#[derive(Debug, Clone, Deserialize)]
pub struct ObservationQuery {
    #[serde(default)]
    pub crop_id: Option<DimensionId>,
    #[serde(default)]
    pub soil_id: Option<DimensionId>,
    #[serde(default)]
    pub stage_id: Option<DimensionId>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

impl Default for ObservationQuery {
    fn default() -> Self {
        Self {
            crop_id: None,
            soil_id: None,
            stage_id: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

const SELECT_JOINED: &str = r#"
    SELECT
        o.id, o.crop_id, c.name AS crop_name,
        o.soil_id, s.name AS soil_name,
        o.stage_id, g.name AS stage_name,
        o.moisture, o.temperature, o.humidity, o.result,
        o.created_at, o.updated_at
    FROM observations o
    JOIN crops c ON o.crop_id = c.id
    JOIN soil_types s ON o.soil_id = s.id
    JOIN growth_stages g ON o.stage_id = g.id
"#;

/// Get observation by ID
pub fn get_observation(conn: &Connection, id: ObservationId) -> Result<Option<ObservationRow>, StorageError> {
    conn.query_row(
        &format!("{} WHERE o.id = ?", SELECT_JOINED),
        params![id],
        ObservationRow::from_row,
    )
    .optional()
    .map_err(StorageError::storage("Observation fetch failed"))
}

/// List observations, newest first
pub fn list_observations(conn: &Connection, query: &ObservationQuery) -> Result<Vec<ObservationRow>, StorageError> {
    let mut sql = String::from(SELECT_JOINED);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(crop_id) = query.crop_id {
        conditions.push("o.crop_id = ?");
        params.push(Box::new(crop_id));
    }
    if let Some(soil_id) = query.soil_id {
        conditions.push("o.soil_id = ?");
        params.push(Box::new(soil_id));
    }
    if let Some(stage_id) = query.stage_id {
        conditions.push("o.stage_id = ?");
        params.push(Box::new(stage_id));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY o.created_at DESC, o.id DESC LIMIT ? OFFSET ?");
    params.push(Box::new(query.limit as i64));
    params.push(Box::new(query.offset as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn
        .prepare(&sql)
        .map_err(StorageError::storage("Prepare failed"))?;

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), ObservationRow::from_row)
        .map_err(StorageError::storage("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StorageError::storage("Row parse failed"))?;

    Ok(rows)
}

/// Check that every dimension id of `new` exists right now
fn check_references(conn: &Connection, new: &NewObservation) -> Result<(), StorageError> {
    let refs = [
        (DimensionKind::Crop, new.crop_id),
        (DimensionKind::Soil, new.soil_id),
        (DimensionKind::Stage, new.stage_id),
    ];
    for (kind, id) in refs {
        if !dimensions::exists(conn, kind, id)? {
            return Err(StorageError::ReferentialIntegrity(format!("{} id {} does not exist", kind, id)));
        }
    }
    Ok(())
}

fn map_write_error(context: &str, e: rusqlite::Error) -> StorageError {
    if is_foreign_key_violation(&e) {
        StorageError::ReferentialIntegrity(format!("{}: {}", context, e))
    } else {
        StorageError::storage(context)(e)
    }
}

/// Insert one observation with server-assigned timestamps
pub fn insert_observation(conn: &Connection, new: &NewObservation) -> Result<ObservationRow, StorageError> {
    check_references(conn, new)?;

    let now = timestamp_now();
    conn.execute(
        r#"
        INSERT INTO observations (
            crop_id, soil_id, stage_id,
            moisture, temperature, humidity, result,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            new.crop_id,
            new.soil_id,
            new.stage_id,
            new.values.moisture,
            new.values.temperature,
            new.values.humidity,
            new.values.result,
            now,
            now,
        ],
    ).map_err(|e| map_write_error("Observation insert failed", e))?;

    let id = conn.last_insert_rowid();
    get_observation(conn, id)?
        .ok_or_else(|| StorageError::Internal("Observation not found after insert".to_string()))
}

/// Overwrite an observation's references and values, refreshing `updated_at`
pub fn update_observation(
    conn: &Connection,
    id: ObservationId,
    new: &NewObservation,
) -> Result<ObservationRow, StorageError> {
    check_references(conn, new)?;

    let changes = conn.execute(
        r#"
        UPDATE observations
        SET crop_id = ?, soil_id = ?, stage_id = ?,
            moisture = ?, temperature = ?, humidity = ?, result = ?,
            updated_at = ?
        WHERE id = ?
        "#,
        params![
            new.crop_id,
            new.soil_id,
            new.stage_id,
            new.values.moisture,
            new.values.temperature,
            new.values.humidity,
            new.values.result,
            timestamp_now(),
            id,
        ],
    ).map_err(|e| map_write_error("Observation update failed", e))?;

    if changes == 0 {
        return Err(StorageError::NotFound(format!("observation {}", id)));
    }

    get_observation(conn, id)?
        .ok_or_else(|| StorageError::Internal("Observation not found after update".to_string()))
}

/// Delete observation by ID
pub fn delete_observation(conn: &Connection, id: ObservationId) -> Result<bool, StorageError> {
    let changes = conn
        .execute("DELETE FROM observations WHERE id = ?", params![id])
        .map_err(StorageError::storage("Observation delete failed"))?;

    Ok(changes > 0)
}
