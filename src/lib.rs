pub mod cli;
pub mod columnar;
pub mod download;
pub mod drift;
pub mod ingest;
pub mod loader;
pub mod promote;
pub mod taxi;
pub mod warehouse;

use std::{env, sync::OnceLock, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands},
    download::HttpDownloader,
    ingest::{ALL_MONTHS, IngestPlan, Ingestor},
    warehouse::{DatasetId, bigquery::BigQueryClient},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("taxi_ingest", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest(args) => handle_ingest(&args),
        Commands::Normalize(args) => handle_normalize(&args),
    }
}

fn handle_ingest(args: &cli::IngestArgs) -> Result<()> {
    let plan = IngestPlan {
        dataset: DatasetId::new(args.project_id.trim(), args.dataset.trim()),
        taxi_types: args.taxi_types.clone(),
        years: args.start_year..=args.end_year,
        months: if args.months.is_empty() {
            ALL_MONTHS.collect()
        } else {
            args.months.clone()
        },
        location: args.location.clone(),
        replace_tables: args.replace_tables,
        base_url: args.base_url.clone(),
    };
    plan.validate()?;
    debug!("Ingest plan: {plan:?}");
    info!(
        "Ingesting {} file(s) into {} for {}-{}",
        plan.file_count(),
        plan.dataset,
        args.start_year,
        args.end_year
    );

    let warehouse = BigQueryClient::from_env(&plan.dataset.project)
        .context("Creating BigQuery client")?
        .with_location(plan.location.clone())
        .with_endpoints(args.api_root.as_str(), args.upload_root.as_str())
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    let downloader = HttpDownloader::new(Duration::from_secs(args.download_timeout_secs))
        .context("Creating HTTP downloader")?;

    let summary = Ingestor::new(&warehouse, &downloader)
        .with_scratch_root(args.scratch_dir.clone())
        .run(&plan)?;
    for (table, rows) in &summary.table_rows {
        info!("{table}: {rows} row(s)");
    }
    Ok(())
}

fn handle_normalize(args: &cli::NormalizeArgs) -> Result<()> {
    let rewritten = columnar::normalize_column_to_float(&args.input, &args.column)
        .with_context(|| format!("Normalizing {:?}", args.input))?;
    if rewritten {
        info!(
            "Column '{}' in {:?} is now FLOAT64",
            args.column, args.input
        );
    } else {
        info!(
            "Column '{}' not present in {:?}; file left unchanged",
            args.column, args.input
        );
    }
    Ok(())
}
