//! Ingestion orchestrator
//!
//! One incoming reading is one unit of work:
//!
//! ```text
//! Validating -> ResolvingDimensions -> Writing -> AuditLogging -> Committed
//!     |                 |                |             |
//!     v                 +-------+--------+-------------+
//!  Rejected                     v
//!                           RolledBack
//! ```
//!
//! Validation runs before the transaction is opened. Dimension creates, the
//! observation row and its audit entry share one IMMEDIATE transaction, so
//! either all of them become visible or none do.
//!
//! The administrative update and delete paths follow the same shape and emit
//! their own `Updated` / `Deleted` audit entries.

use std::fmt;
use std::sync::Arc;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::db::audit::{self, AuditAction, AuditEntry};
use crate::db::dimensions::{self, normalize_name, DimensionId, DimensionKind, DimensionRow, DEFAULT_MAX_RESOLVE_ATTEMPTS};
use crate::db::observations::{self, NewObservation, ObservationId, ObservationQuery, ObservationRow, ObservationValues};
use crate::db::{DbStats, ObservationDb};
use crate::error::StorageError;
use crate::validation::{validate_names, validate_values};

/// One incoming sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub crop_name: String,
    pub soil_name: String,
    pub stage_name: String,
    pub moisture: f64,
    pub temperature: f64,
    pub humidity: f64,
    #[serde(default)]
    pub result: Option<i32>,
    /// Calling principal; `None` when unauthenticated
    #[serde(default)]
    pub actor: Option<String>,
}

impl IngestRequest {
    pub fn values(&self) -> ObservationValues {
        ObservationValues {
            moisture: self.moisture,
            temperature: self.temperature,
            humidity: self.humidity,
            result: self.result,
        }
    }
}

/// Partial change to an existing observation. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationPatch {
    #[serde(default)]
    pub crop_name: Option<String>,
    #[serde(default)]
    pub soil_name: Option<String>,
    #[serde(default)]
    pub stage_name: Option<String>,
    #[serde(default)]
    pub moisture: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    /// `Some(None)` clears the outcome code, `None` keeps it
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub result: Option<Option<i32>>,
}

/// Distinguish an explicit `null` from a missing field
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Where an ingestion currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    Validating,
    ResolvingDimensions,
    Writing,
    AuditLogging,
    Committed,
    Rejected,
    RolledBack,
}

impl IngestPhase {
    /// Terminal phase reached when a failure happens in this phase
    pub fn on_failure(self) -> IngestPhase {
        match self {
            IngestPhase::Validating | IngestPhase::Rejected => IngestPhase::Rejected,
            _ => IngestPhase::RolledBack,
        }
    }
}

impl fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestPhase::Validating => "validating",
            IngestPhase::ResolvingDimensions => "resolving_dimensions",
            IngestPhase::Writing => "writing",
            IngestPhase::AuditLogging => "audit_logging",
            IngestPhase::Committed => "committed",
            IngestPhase::Rejected => "rejected",
            IngestPhase::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

fn advance(phase: &mut IngestPhase, next: IngestPhase) {
    debug!(from = %phase, to = %next, "Ingest phase");
    *phase = next;
}

/// Per-reading failure in a bulk ingest
#[derive(Debug, Clone, Serialize)]
pub struct BulkIngestError {
    pub index: usize,
    pub kind: &'static str,
    pub message: String,
}

/// Result of bulk operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkIngestResult {
    pub inserted: u64,
    pub observation_ids: Vec<ObservationId>,
    pub errors: Vec<BulkIngestError>,
}

/// Composes validation, dimension resolution, the observation write and the
/// audit record into one atomic unit of work
pub struct Ingestor {
    db: Arc<ObservationDb>,
    max_resolve_attempts: u32,
    default_actor: Option<String>,
}

impl Ingestor {
    pub fn new(db: Arc<ObservationDb>) -> Self {
        Self {
            db,
            max_resolve_attempts: DEFAULT_MAX_RESOLVE_ATTEMPTS,
            default_actor: None,
        }
    }

    /// Bound on fetch-or-create attempts per dimension
    pub fn with_max_resolve_attempts(mut self, attempts: u32) -> Self {
        self.max_resolve_attempts = attempts.max(1);
        self
    }

    /// Actor recorded when a request carries none
    pub fn with_default_actor(mut self, actor: Option<String>) -> Self {
        self.default_actor = actor.and_then(|a| clean_actor(&a));
        self
    }

    fn actor_for(&self, requested: Option<&str>) -> Option<String> {
        requested
            .and_then(clean_actor)
            .or_else(|| self.default_actor.clone())
    }

    /// Ingest one reading, returning the new observation id
    pub fn ingest(&self, request: &IngestRequest) -> Result<ObservationId, StorageError> {
        let mut phase = IngestPhase::Validating;
        let result = self.run_ingest(request, &mut phase);

        match &result {
            Ok(id) => info!(
                observation_id = id,
                crop = request.crop_name.trim(),
                "Observation ingested"
            ),
            Err(e) => warn!(
                phase = %phase,
                outcome = %phase.on_failure(),
                kind = e.kind(),
                error = %e,
                "Ingestion failed"
            ),
        }

        result
    }

    fn run_ingest(&self, request: &IngestRequest, phase: &mut IngestPhase) -> Result<ObservationId, StorageError> {
        validate_names(&request.crop_name, &request.soil_name, &request.stage_name)?;
        let values = request.values();
        validate_values(&values)?;

        let actor = self.actor_for(request.actor.as_deref());

        // Past validation, any failure (lock, busy timeout) is a storage rollback
        advance(phase, IngestPhase::ResolvingDimensions);
        self.db.with_conn_mut(|conn| {
            let tx = begin(conn)?;

            let new = NewObservation {
                crop_id: self.resolve(&tx, DimensionKind::Crop, &request.crop_name)?,
                soil_id: self.resolve(&tx, DimensionKind::Soil, &request.soil_name)?,
                stage_id: self.resolve(&tx, DimensionKind::Stage, &request.stage_name)?,
                values,
            };

            advance(phase, IngestPhase::Writing);
            let row = observations::insert_observation(&tx, &new)?;

            advance(phase, IngestPhase::AuditLogging);
            let payload = audit::change_payload(None, Some(&row))?;
            audit::record(&tx, Some(row.id), AuditAction::Created, &payload, actor.as_deref())?;

            tx.commit().map_err(StorageError::storage("Commit failed"))?;
            advance(phase, IngestPhase::Committed);

            Ok(row.id)
        })
    }

    fn resolve(&self, conn: &Connection, kind: DimensionKind, name: &str) -> Result<DimensionId, StorageError> {
        dimensions::resolve(conn, kind, name, self.max_resolve_attempts)
    }

    /// Ingest many readings, each in its own unit of work.
    ///
    /// A rejected reading is reported in `errors` and does not affect the rest.
    pub fn ingest_batch(&self, requests: &[IngestRequest]) -> BulkIngestResult {
        self.ingest_each(requests.iter().cloned().map(Ok))
    }

    /// Ingest a sequence of decoded readings. Items that failed to decode are
    /// reported at their index alongside the readings that failed to ingest.
    pub(crate) fn ingest_each<I>(&self, items: I) -> BulkIngestResult
    where
        I: IntoIterator<Item = Result<IngestRequest, StorageError>>,
    {
        let mut outcome = BulkIngestResult::default();

        for (index, item) in items.into_iter().enumerate() {
            match item.and_then(|request| self.ingest(&request)) {
                Ok(id) => {
                    outcome.inserted += 1;
                    outcome.observation_ids.push(id);
                }
                Err(e) => {
                    debug!(index, kind = e.kind(), "Reading skipped");
                    outcome.errors.push(BulkIngestError {
                        index,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            inserted = outcome.inserted,
            failed = outcome.errors.len(),
            "Bulk ingest finished"
        );
        outcome
    }

    /// Apply a partial update to an observation, writing one `Updated` audit entry
    pub fn update(
        &self,
        id: ObservationId,
        patch: &ObservationPatch,
        actor: Option<&str>,
    ) -> Result<ObservationRow, StorageError> {
        let names = [
            (DimensionKind::Crop, &patch.crop_name),
            (DimensionKind::Soil, &patch.soil_name),
            (DimensionKind::Stage, &patch.stage_name),
        ];
        for (kind, name) in names {
            if let Some(name) = name {
                normalize_name(kind, name)?;
            }
        }

        let actor = self.actor_for(actor);

        let result = self.db.with_conn_mut(|conn| {
            let tx = begin(conn)?;

            let before = observations::get_observation(&tx, id)?
                .ok_or_else(|| StorageError::NotFound(format!("observation {}", id)))?;

            let values = ObservationValues {
                moisture: patch.moisture.unwrap_or(before.moisture),
                temperature: patch.temperature.unwrap_or(before.temperature),
                humidity: patch.humidity.unwrap_or(before.humidity),
                result: patch.result.unwrap_or(before.result),
            };
            validate_values(&values)?;

            let new = NewObservation {
                crop_id: self.resolve_or_keep(&tx, DimensionKind::Crop, &patch.crop_name, before.crop_id)?,
                soil_id: self.resolve_or_keep(&tx, DimensionKind::Soil, &patch.soil_name, before.soil_id)?,
                stage_id: self.resolve_or_keep(&tx, DimensionKind::Stage, &patch.stage_name, before.stage_id)?,
                values,
            };

            let after = observations::update_observation(&tx, id, &new)?;
            let payload = audit::change_payload(Some(&before), Some(&after))?;
            audit::record(&tx, Some(id), AuditAction::Updated, &payload, actor.as_deref())?;

            tx.commit().map_err(StorageError::storage("Commit failed"))?;
            Ok(after)
        });

        match &result {
            Ok(_) => info!(observation_id = id, "Observation updated"),
            Err(e) => warn!(observation_id = id, kind = e.kind(), error = %e, "Observation update failed"),
        }
        result
    }

    fn resolve_or_keep(
        &self,
        conn: &Connection,
        kind: DimensionKind,
        name: &Option<String>,
        current: DimensionId,
    ) -> Result<DimensionId, StorageError> {
        match name {
            Some(name) => self.resolve(conn, kind, name),
            None => Ok(current),
        }
    }

    /// Delete an observation, writing one `Deleted` audit entry.
    ///
    /// Returns false, and records nothing, when the observation does not exist.
    pub fn delete(&self, id: ObservationId, actor: Option<&str>) -> Result<bool, StorageError> {
        let actor = self.actor_for(actor);

        let result = self.db.with_conn_mut(|conn| {
            let tx = begin(conn)?;

            let Some(before) = observations::get_observation(&tx, id)? else {
                return Ok(false);
            };

            observations::delete_observation(&tx, id)?;
            let payload = audit::change_payload(Some(&before), None)?;
            audit::record(&tx, Some(id), AuditAction::Deleted, &payload, actor.as_deref())?;

            tx.commit().map_err(StorageError::storage("Commit failed"))?;
            Ok(true)
        });

        match &result {
            Ok(true) => info!(observation_id = id, "Observation deleted"),
            Ok(false) => debug!(observation_id = id, "Delete of missing observation ignored"),
            Err(e) => warn!(observation_id = id, kind = e.kind(), error = %e, "Observation delete failed"),
        }
        result
    }

    pub fn get(&self, id: ObservationId) -> Result<Option<ObservationRow>, StorageError> {
        self.db.with_conn(|conn| observations::get_observation(conn, id))
    }

    pub fn list(&self, query: &ObservationQuery) -> Result<Vec<ObservationRow>, StorageError> {
        self.db.with_conn(|conn| observations::list_observations(conn, query))
    }

    pub fn dimensions(&self, kind: DimensionKind) -> Result<Vec<DimensionRow>, StorageError> {
        self.db.with_conn(|conn| dimensions::list_dimensions(conn, kind))
    }

    /// Look up a dimension id without creating it
    pub fn find_dimension(&self, kind: DimensionKind, name: &str) -> Result<Option<DimensionId>, StorageError> {
        self.db.with_conn(|conn| dimensions::find_by_name(conn, kind, name))
    }

    /// Delete a dimension row; rejected while observations reference it
    pub fn remove_dimension(&self, kind: DimensionKind, name: &str) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| dimensions::delete_dimension(conn, kind, name))
    }

    pub fn audit_trail(&self, id: ObservationId) -> Result<Vec<AuditEntry>, StorageError> {
        self.db.with_conn(|conn| audit::audit_trail(conn, id))
    }

    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, StorageError> {
        self.db.with_conn(|conn| audit::recent_audit(conn, limit))
    }

    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.db.stats()
    }
}

/// Take the write lock up front so concurrent units of work queue on
/// `busy_timeout` instead of failing on a lock upgrade
fn begin(conn: &mut Connection) -> Result<Transaction<'_>, StorageError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(StorageError::storage("Transaction failed"))
}

fn clean_actor(actor: &str) -> Option<String> {
    let actor = actor.trim();
    if actor.is_empty() {
        None
    } else {
        Some(actor.to_string())
    }
}
