use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::constants::{DEFAULT_CSV_PATH, DEFAULT_LOG_DIR, DEFAULT_PROKNOW_BASE_URL};

#[derive(Parser, Debug)]
#[command(name = "proknow_metrics")]
#[command(about = "Write custom metric values onto ProKnow patients and entities", long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub conn: ConnectionArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// ProKnow organization URL.
    #[arg(long, env = "PROKNOW_BASE_URL", default_value = DEFAULT_PROKNOW_BASE_URL, global = true)]
    pub base_url: String,

    /// Credentials JSON file ({"id": ..., "secret": ...}) downloaded from ProKnow.
    #[arg(long, env = "PROKNOW_CREDENTIALS", global = true)]
    pub credentials: Option<PathBuf>,

    /// Workspace id, slug or name.
    #[arg(long, env = "PROKNOW_WORKSPACE", global = true)]
    pub workspace: Option<String>,

    /// Max attempts for transient API failures.
    #[arg(long, default_value_t = 5, global = true)]
    pub max_retries: u32,

    /// Directory for run logs.
    #[arg(long, default_value = DEFAULT_LOG_DIR, global = true)]
    pub log_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply custom metric values listed in a CSV file.
    ApplyCsv(ApplyCsvArgs),
    /// Compute plan and image-set metrics for every patient in a collection.
    DeriveMetrics(CollectionArgs),
    /// List every entity of every patient in a collection to CSV.
    ListEntities(ListEntitiesArgs),
    /// Dump a patient's ProKnow payloads to JSON files.
    ExportJson(ExportJsonArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ApplyCsvArgs {
    /// Input CSV with PatientID, CustomMetricName, Description, Context, Value columns.
    #[arg(long, default_value = DEFAULT_CSV_PATH)]
    pub csv_path: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CollectionArgs {
    /// Workspace collection name.
    #[arg(long, default_value = "My Collection")]
    pub collection: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ListEntitiesArgs {
    #[command(flatten)]
    pub collection: CollectionArgs,

    /// Output CSV. Defaults to <collection>_patient_entities.csv.
    #[arg(long)]
    pub csv_out: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExportJsonArgs {
    /// Patient MRN.
    #[arg(long)]
    pub mrn: String,

    /// Output directory for JSON files.
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    /// Export only the entity of this context (requires --description).
    #[arg(long, requires = "description")]
    pub context: Option<String>,

    /// Description of the single entity to export (requires --context).
    #[arg(long, requires = "context")]
    pub description: Option<String>,
}
