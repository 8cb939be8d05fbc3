//! Bulk import of readings from JSON or CSV files
//!
//! Both formats are decoded one reading at a time. A reading that cannot be
//! decoded (missing column, `"moisture": "wet"`) is reported as
//! `invalid_input` at its index and the remaining readings are still ingested.
//!
//! ## CSV layout
//!
//! The header row names the columns of the field data export:
//!
//! ```text
//! crop ID,soil_type,Seedling Stage,MOI,temp,humidity,result
//! Wheat,Black Soil,Germination,1,25,80,1
//! ```
//!
//! `result` may be absent or empty.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::StorageError;
use crate::ingest::{BulkIngestResult, IngestRequest, Ingestor};

/// Columns every CSV import must carry
pub const CSV_REQUIRED_COLUMNS: [&str; 6] = ["crop ID", "soil_type", "Seedling Stage", "MOI", "temp", "humidity"];

/// File format of a bulk import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    Json,
    Csv,
}

impl ImportFormat {
    /// Guess the format from a file extension, defaulting to JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ImportFormat::Csv,
            _ => ImportFormat::Json,
        }
    }
}

/// One row of a CSV export
#[derive(Debug, Deserialize)]
struct CsvReading {
    #[serde(rename = "crop ID")]
    crop: String,
    #[serde(rename = "soil_type")]
    soil: String,
    #[serde(rename = "Seedling Stage")]
    stage: String,
    #[serde(rename = "MOI")]
    moisture: f64,
    #[serde(rename = "temp")]
    temperature: f64,
    humidity: f64,
    #[serde(default)]
    result: Option<i32>,
}

impl CsvReading {
    fn into_request(self, actor: Option<&str>) -> IngestRequest {
        IngestRequest {
            crop_name: self.crop,
            soil_name: self.soil,
            stage_name: self.stage,
            moisture: self.moisture,
            temperature: self.temperature,
            humidity: self.humidity,
            result: self.result,
            actor: actor.map(str::to_string),
        }
    }
}

/// Import a file, choosing the decoder by `format`
pub fn import_file(
    ingestor: &Ingestor,
    path: &Path,
    format: ImportFormat,
    actor: Option<&str>,
) -> Result<BulkIngestResult, StorageError> {
    info!(file = %path.display(), ?format, "Importing readings");
    let file = std::fs::File::open(path)?;
    match format {
        ImportFormat::Json => import_json(ingestor, file, actor),
        ImportFormat::Csv => import_csv(ingestor, file, actor),
    }
}

/// Import a JSON array of readings.
///
/// Only a document that is not a JSON array fails as a whole. `actor` fills
/// in readings that name none.
pub fn import_json<R: Read>(
    ingestor: &Ingestor,
    reader: R,
    actor: Option<&str>,
) -> Result<BulkIngestResult, StorageError> {
    let items: Vec<serde_json::Value> = serde_json::from_reader(reader)?;

    let requests = items.into_iter().enumerate().map(|(index, item)| {
        let mut request: IngestRequest = serde_json::from_value(item)
            .map_err(|e| StorageError::InvalidInput(format!("reading {}: {}", index, e)))?;
        if request.actor.is_none() {
            request.actor = actor.map(str::to_string);
        }
        Ok(request)
    });

    Ok(ingestor.ingest_each(requests))
}

/// Import a CSV export with a header row.
///
/// A header missing one of [`CSV_REQUIRED_COLUMNS`] fails as a whole.
pub fn import_csv<R: Read>(
    ingestor: &Ingestor,
    reader: R,
    actor: Option<&str>,
) -> Result<BulkIngestResult, StorageError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let missing: Vec<&str> = CSV_REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|h| h == *column))
        .collect();
    if !missing.is_empty() {
        return Err(StorageError::InvalidInput(format!("CSV header is missing columns: {}", missing.join(", "))));
    }

    let requests = rdr.deserialize::<CsvReading>().enumerate().map(|(index, row)| {
        row.map(|reading| reading.into_request(actor))
            .map_err(|e| StorageError::InvalidInput(format!("row {}: {}", index, e)))
    });

    Ok(ingestor.ingest_each(requests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ObservationDb;
    use crate::DimensionKind;
    use std::sync::Arc;

    fn ingestor() -> Ingestor {
        Ingestor::new(Arc::new(ObservationDb::open_in_memory().unwrap()))
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ImportFormat::from_path(Path::new("data/cropdata.csv")), ImportFormat::Csv);
        assert_eq!(ImportFormat::from_path(Path::new("readings.CSV")), ImportFormat::Csv);
        assert_eq!(ImportFormat::from_path(Path::new("readings.json")), ImportFormat::Json);
        assert_eq!(ImportFormat::from_path(Path::new("readings")), ImportFormat::Json);
    }

    #[test]
    fn test_json_bad_reading_does_not_block_others() {
        let ingestor = ingestor();
        let json = r#"[
            {"crop_name": "Maize", "soil_name": "Loam", "stage_name": "Seedling",
             "moisture": 12.5, "temperature": 24.0, "humidity": 55.0, "result": 1},
            {"crop_name": "Maize", "soil_name": "Loam", "stage_name": "Seedling",
             "moisture": "wet", "temperature": 24.0, "humidity": 55.0},
            {"crop_name": "Wheat", "soil_name": "Clay", "stage_name": "Flowering",
             "moisture": 9.0, "temperature": 20.0, "humidity": 40.0, "actor": "sensor-2"}
        ]"#;

        let outcome = import_json(&ingestor, json.as_bytes(), Some("importer")).unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);
        assert_eq!(outcome.errors[0].kind, "invalid_input");
        assert!(outcome.errors[0].message.contains("reading 1"));

        let first = ingestor.audit_trail(outcome.observation_ids[0]).unwrap();
        assert_eq!(first[0].actor.as_deref(), Some("importer"));
        let last = ingestor.audit_trail(outcome.observation_ids[1]).unwrap();
        assert_eq!(last[0].actor.as_deref(), Some("sensor-2"));
    }

    #[test]
    fn test_json_not_an_array() {
        let ingestor = ingestor();
        let err = import_json(&ingestor, r#"{"crop_name": "Maize"}"#.as_bytes(), None).unwrap_err();
        assert_eq!(err.kind(), "json");
        assert_eq!(ingestor.stats().unwrap().observation_count, 0);
    }

    #[test]
    fn test_csv_export_layout() {
        let ingestor = ingestor();
        let csv = "\
crop ID,soil_type,Seedling Stage,MOI,temp,humidity,result
Wheat,Black Soil,Germination,1,25,80,1
Wheat,Black Soil,Germination,2,26,150,0
Wheat,Black Soil,Germination,dry,26,70,0
Maize, Red Soil ,Flowering,7,30,60,
";

        let outcome = import_csv(&ingestor, csv.as_bytes(), Some("loader")).unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!((outcome.errors[0].index, outcome.errors[0].kind), (1, "invalid_range"));
        assert_eq!((outcome.errors[1].index, outcome.errors[1].kind), (2, "invalid_input"));

        let maize = ingestor.get(outcome.observation_ids[1]).unwrap().unwrap();
        assert_eq!(maize.soil_name, "Red Soil");
        assert_eq!(maize.moisture, 7.0);
        assert_eq!(maize.result, None);

        let crops = ingestor.dimensions(DimensionKind::Crop).unwrap();
        assert_eq!(crops.len(), 2);
        assert_eq!(ingestor.recent_audit(10).unwrap()[0].actor.as_deref(), Some("loader"));
    }

    #[test]
    fn test_csv_missing_columns() {
        let ingestor = ingestor();
        let err = import_csv(&ingestor, "crop ID,soil_type,MOI\nWheat,Loam,3\n".as_bytes(), None).unwrap_err();
        match err {
            StorageError::InvalidInput(msg) => {
                assert!(msg.contains("Seedling Stage"));
                assert!(msg.contains("humidity"));
            }
            other => panic!("expected InvalidInput, got {other}"),
        }
        assert_eq!(ingestor.stats().unwrap().observation_count, 0);
    }
}
