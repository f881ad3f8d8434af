use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    taxi::{DEFAULT_BASE_URL, TaxiType},
    warehouse::bigquery::{API_ROOT, UPLOAD_ROOT},
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Load NYC taxi trip parquet files into BigQuery",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Download monthly trip files and append them to per-taxi-type tables
    Ingest(IngestArgs),
    /// Cast one column of a local parquet file to FLOAT64 in place
    Normalize(NormalizeArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// GCP project id that owns the dataset and runs the jobs
    #[arg(long = "project-id")]
    pub project_id: String,
    /// Destination dataset name
    #[arg(long, default_value = "raw_ny_taxi")]
    pub dataset: String,
    /// Taxi types to ingest
    #[arg(
        long = "taxi-types",
        value_enum,
        num_args = 1..,
        value_delimiter = ',',
        default_values_t = [TaxiType::Yellow, TaxiType::Green]
    )]
    pub taxi_types: Vec<TaxiType>,
    /// First year to load (inclusive)
    #[arg(long = "start-year", default_value_t = 2019)]
    pub start_year: i32,
    /// Last year to load (inclusive)
    #[arg(long = "end-year", default_value_t = 2020)]
    pub end_year: i32,
    /// Restrict loading to these months (1-12); all months when omitted
    #[arg(
        long = "months",
        num_args = 1..,
        value_delimiter = ',',
        value_parser = clap::value_parser!(u32).range(1..=12)
    )]
    pub months: Vec<u32>,
    /// Dataset location used when the dataset is created
    #[arg(long, default_value = "US")]
    pub location: String,
    /// Drop destination tables before loading data
    #[arg(long = "replace-tables")]
    pub replace_tables: bool,
    /// Base URL the monthly parquet files are downloaded from
    #[arg(long = "base-url", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    /// Directory under which per-run scratch directories are created
    #[arg(long = "scratch-dir")]
    pub scratch_dir: Option<PathBuf>,
    /// Per-operation timeout for file downloads, in seconds
    #[arg(long = "download-timeout-secs", default_value_t = 120)]
    pub download_timeout_secs: u64,
    /// Interval between warehouse job status polls, in milliseconds
    #[arg(long = "poll-interval-ms", default_value_t = 1000)]
    pub poll_interval_ms: u64,
    /// BigQuery REST API root (override to target an emulator)
    #[arg(long = "api-root", default_value = API_ROOT)]
    pub api_root: String,
    /// BigQuery media upload root used for load jobs
    #[arg(long = "upload-root", default_value = UPLOAD_ROOT)]
    pub upload_root: String,
}

#[derive(Debug, Args)]
pub struct NormalizeArgs {
    /// Parquet file to rewrite
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Column to cast to FLOAT64
    #[arg(short = 'c', long = "column")]
    pub column: String,
}
