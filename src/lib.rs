//! Cropwatch Storage - sensor observation store for crop-growing experiments
//!
//! Records moisture, temperature, humidity and outcome readings, each tied to
//! a crop, a soil type and a growth stage. Dimension rows are created the
//! first time a name is seen.
//!
//! ## Ingestion
//!
//! [`Ingestor::ingest`] is the entry point. One reading is one atomic unit of
//! work:
//!
//! 1. Validate names and numeric ranges (nothing is written on failure)
//! 2. Resolve crop, soil and stage names, creating rows as needed
//! 3. Insert the observation
//! 4. Append a `Created` audit entry
//!
//! Steps 2-4 share a single SQLite transaction.
//!
//! [`import`] feeds JSON arrays and CSV exports through the same path, one
//! unit of work per reading.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/cropwatch-storage/
//! ├── observations.db        # SQLite: dimensions, observations, audit log
//! └── config.toml            # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod ingest;
pub mod validation;

// Re-exports
pub use config::Config;
pub use db::{AuditAction, AuditEntry, DbStats, DimensionKind, ObservationDb, ObservationQuery, ObservationRow};
pub use error::StorageError;
pub use import::ImportFormat;
pub use ingest::{BulkIngestResult, IngestPhase, IngestRequest, Ingestor, ObservationPatch};
