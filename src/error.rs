//! Error types for cropwatch-storage

use rusqlite::ffi;
use thiserror::Error;

use crate::db::dimensions::DimensionKind;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid range: {field} = {value} outside {}", format_range(.min, .max))]
    InvalidRange {
        field: &'static str,
        value: f64,
        min: f64,
        /// `None` when the range is open above
        max: Option<f64>,
    },

    #[error("Referential integrity error: {0}")]
    ReferentialIntegrity(String),

    #[error("Conflict retry exhausted: {kind} '{name}' did not converge after {attempts} attempts")]
    ConflictRetryExhausted {
        kind: DimensionKind,
        name: String,
        attempts: u32,
    },

    #[error("Storage failure ({context}): {source}")]
    StorageFailure {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wrap a rusqlite error with the operation that produced it.
    ///
    /// Meant for `map_err`: `.map_err(StorageError::storage("Insert failed"))`.
    pub fn storage(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> StorageError {
        let context = context.into();
        move |source| StorageError::StorageFailure { context, source }
    }

    /// Stable snake_case label for structured reporting
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::InvalidInput(_) => "invalid_input",
            StorageError::InvalidRange { .. } => "invalid_range",
            StorageError::ReferentialIntegrity(_) => "referential_integrity",
            StorageError::ConflictRetryExhausted { .. } => "conflict_retry_exhausted",
            StorageError::StorageFailure { .. } => "storage_failure",
            StorageError::NotFound(_) => "not_found",
            StorageError::Io(_) => "io",
            StorageError::Json(_) => "json",
            StorageError::Csv(_) => "csv",
            StorageError::Config(_) => "config",
            StorageError::Internal(_) => "internal",
        }
    }

    /// Offending field, for the error kinds that carry one
    pub fn field(&self) -> Option<&'static str> {
        match self {
            StorageError::InvalidRange { field, .. } => Some(*field),
            _ => None,
        }
    }
}

fn format_range(min: &f64, max: &Option<f64>) -> String {
    match max {
        Some(max) => format!("[{}, {}]", min, max),
        None => format!("[{}, +inf)", min),
    }
}

/// Whether a rusqlite error is a constraint violation with the given extended code
pub(crate) fn is_constraint(err: &rusqlite::Error, extended_code: i32) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation && e.extended_code == extended_code
    )
}

/// Whether a rusqlite error is a foreign key violation.
///
/// Immediate violations report `SQLITE_CONSTRAINT_FOREIGNKEY`. `ON DELETE
/// RESTRICT` actions are run as internal triggers and report
/// `SQLITE_CONSTRAINT_TRIGGER` with the foreign key message instead.
pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    if is_constraint(err, ffi::SQLITE_CONSTRAINT_FOREIGNKEY) {
        return true;
    }
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.extended_code == ffi::SQLITE_CONSTRAINT_TRIGGER && msg.contains("FOREIGN KEY")
    )
}

/// Whether a rusqlite error is lock contention that may clear on retry
pub(crate) fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_message() {
        let err = StorageError::InvalidRange {
            field: "humidity",
            value: 150.0,
            min: 0.0,
            max: Some(100.0),
        };
        assert_eq!(err.to_string(), "Invalid range: humidity = 150 outside [0, 100]");
        assert_eq!(err.kind(), "invalid_range");
        assert_eq!(err.field(), Some("humidity"));
    }

    #[test]
    fn test_open_range_message() {
        let err = StorageError::InvalidRange {
            field: "moisture",
            value: -1.5,
            min: 0.0,
            max: None,
        };
        assert_eq!(err.to_string(), "Invalid range: moisture = -1.5 outside [0, +inf)");
    }

    #[test]
    fn test_storage_wrapper_keeps_source() {
        let err = StorageError::storage("Query failed")(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(err.kind(), "storage_failure");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_restrict_action_is_foreign_key_violation() {
        let restrict = rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT_TRIGGER),
            Some("FOREIGN KEY constraint failed".to_string()),
        );
        assert!(is_foreign_key_violation(&restrict));

        let immediate = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_CONSTRAINT_FOREIGNKEY), None);
        assert!(is_foreign_key_violation(&immediate));

        let audit_guard = rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT_TRIGGER),
            Some("audit entries are append-only".to_string()),
        );
        assert!(!is_foreign_key_violation(&audit_guard));
    }
}
