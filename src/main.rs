//! Cropwatch Storage CLI
//!
//! ## Usage
//!
//! ```bash
//! # Record one reading
//! cropwatch-storage ingest --crop Maize --soil Loam --stage Seedling \
//!     --moisture 12.5 --temperature 24 --humidity 55 --result 1 --actor sensor-7
//!
//! # Import a JSON array of readings, or a CSV export
//! cropwatch-storage import readings.json
//! cropwatch-storage import data/cropdata_updated.csv --actor loader
//!
//! # Read back
//! cropwatch-storage get 1
//! cropwatch-storage list --crop Maize --limit 20
//! cropwatch-storage audit --observation 1
//!
//! # Use a custom storage directory
//! cropwatch-storage --storage-dir /data/cropwatch stats
//! ```
//!
//! Every command prints JSON on stdout. Failures print
//! `{"error": <kind>, "message": ...}` and exit non-zero.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use cropwatch_storage::import::import_file;
use cropwatch_storage::{
    Config, DimensionKind, ImportFormat, IngestRequest, Ingestor, ObservationDb, ObservationPatch, ObservationQuery,
    StorageError,
};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cropwatch-storage")]
#[command(about = "Sensor observation store for crop-growing experiments")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory (overrides config file)
    #[arg(long, env = "CROPWATCH_STORAGE_DIR", global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record one sensor reading
    Ingest {
        #[arg(long)]
        crop: String,
        #[arg(long)]
        soil: String,
        #[arg(long)]
        stage: String,
        #[arg(long, allow_negative_numbers = true)]
        moisture: f64,
        #[arg(long, allow_negative_numbers = true)]
        temperature: f64,
        #[arg(long, allow_negative_numbers = true)]
        humidity: f64,
        /// Outcome code
        #[arg(long, allow_negative_numbers = true)]
        result: Option<i32>,
        /// Calling principal recorded in the audit log
        #[arg(long, env = "CROPWATCH_ACTOR")]
        actor: Option<String>,
    },

    /// Ingest a JSON array or CSV export of readings, one unit of work each
    Import {
        /// JSON `[{"crop_name": ..., ...}]` or CSV with a
        /// `crop ID,soil_type,Seedling Stage,MOI,temp,humidity,result` header
        file: PathBuf,
        /// File format (default: from the file extension)
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
        /// Actor recorded for readings that name none
        #[arg(long, env = "CROPWATCH_ACTOR")]
        actor: Option<String>,
    },

    /// Show one observation
    Get {
        id: i64,
    },

    /// List observations, newest first
    List {
        /// Only observations of this crop
        #[arg(long)]
        crop: Option<String>,
        /// Only observations on this soil type
        #[arg(long)]
        soil: Option<String>,
        /// Only observations at this growth stage
        #[arg(long)]
        stage: Option<String>,
        #[arg(long, default_value = "100")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Change fields of an existing observation
    Update {
        id: i64,
        #[arg(long)]
        crop: Option<String>,
        #[arg(long)]
        soil: Option<String>,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        moisture: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        temperature: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        humidity: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        result: Option<i32>,
        /// Clear the outcome code
        #[arg(long, conflicts_with = "result")]
        clear_result: bool,
        #[arg(long, env = "CROPWATCH_ACTOR")]
        actor: Option<String>,
    },

    /// Delete an observation (its audit trail is kept)
    Delete {
        id: i64,
        #[arg(long, env = "CROPWATCH_ACTOR")]
        actor: Option<String>,
    },

    /// List known crops, soil types or growth stages
    Dimensions {
        /// crop, soil or stage
        kind: DimensionKind,
    },

    /// Delete an unreferenced dimension row
    RemoveDimension {
        /// crop, soil or stage
        kind: DimensionKind,
        name: String,
    },

    /// Show audit entries
    Audit {
        /// Full trail of one observation
        #[arg(long)]
        observation: Option<i64>,
        /// Number of recent entries when no observation is given
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Row counts per table
    Stats,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
}

impl From<FormatArg> for ImportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => ImportFormat::Json,
            FormatArg::Csv => ImportFormat::Csv,
        }
    }
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    error: &'a str,
    message: String,
}

fn main() -> ExitCode {
    // Initialize tracing; logs go to stderr so stdout stays JSON
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cropwatch_storage=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Command failed");
            let report = ErrorReport {
                error: e.kind(),
                message: e.to_string(),
            };
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{{\"error\": \"{}\"}}", e.kind()),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), StorageError> {
    // Load config
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }

    std::fs::create_dir_all(&config.storage_dir)?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(ObservationDb::open(&config.db_path(), config.busy_timeout())?);
    let ingestor = Ingestor::new(db)
        .with_max_resolve_attempts(config.max_resolve_attempts)
        .with_default_actor(config.default_actor.clone());

    match cli.command {
        Command::Ingest { crop, soil, stage, moisture, temperature, humidity, result, actor } => {
            let request = IngestRequest {
                crop_name: crop,
                soil_name: soil,
                stage_name: stage,
                moisture,
                temperature,
                humidity,
                result,
                actor,
            };
            let id = ingestor.ingest(&request)?;
            print_json(&serde_json::json!({ "observation_id": id }))
        }
        Command::Import { file, format, actor } => {
            let format = format.map(ImportFormat::from).unwrap_or_else(|| ImportFormat::from_path(&file));
            print_json(&import_file(&ingestor, &file, format, actor.as_deref())?)
        }
        Command::Get { id } => {
            let row = ingestor
                .get(id)?
                .ok_or_else(|| StorageError::NotFound(format!("observation {}", id)))?;
            print_json(&row)
        }
        Command::List { crop, soil, stage, limit, offset } => {
            let query = ObservationQuery {
                crop_id: lookup(&ingestor, DimensionKind::Crop, crop)?,
                soil_id: lookup(&ingestor, DimensionKind::Soil, soil)?,
                stage_id: lookup(&ingestor, DimensionKind::Stage, stage)?,
                limit,
                offset,
            };
            print_json(&ingestor.list(&query)?)
        }
        Command::Update { id, crop, soil, stage, moisture, temperature, humidity, result, clear_result, actor } => {
            let patch = ObservationPatch {
                crop_name: crop,
                soil_name: soil,
                stage_name: stage,
                moisture,
                temperature,
                humidity,
                result: if clear_result { Some(None) } else { result.map(Some) },
            };
            print_json(&ingestor.update(id, &patch, actor.as_deref())?)
        }
        Command::Delete { id, actor } => {
            if !ingestor.delete(id, actor.as_deref())? {
                return Err(StorageError::NotFound(format!("observation {}", id)));
            }
            print_json(&serde_json::json!({ "deleted": id }))
        }
        Command::Dimensions { kind } => print_json(&ingestor.dimensions(kind)?),
        Command::RemoveDimension { kind, name } => {
            if !ingestor.remove_dimension(kind, &name)? {
                return Err(StorageError::NotFound(format!("{} '{}'", kind, name.trim())));
            }
            print_json(&serde_json::json!({ "removed": name.trim(), "kind": kind }))
        }
        Command::Audit { observation, limit } => match observation {
            Some(id) => print_json(&ingestor.audit_trail(id)?),
            None => print_json(&ingestor.recent_audit(limit)?),
        },
        Command::Stats => print_json(&ingestor.stats()?),
    }
}

/// Map an optional name filter to its id; an unknown name is `NotFound`
fn lookup(ingestor: &Ingestor, kind: DimensionKind, name: Option<String>) -> Result<Option<i64>, StorageError> {
    match name {
        Some(name) => ingestor
            .find_dimension(kind, &name)?
            .map(Some)
            .ok_or_else(|| StorageError::NotFound(format!("{} '{}'", kind, name.trim()))),
        None => Ok(None),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), StorageError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
