use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use scanlog::export::{self, ExportFormat};
use scanlog::{RecordStore, ScanlogConfig};
use tracing::info;

/// Inspect a scanlog record file without touching it.
#[derive(Parser, Debug)]
#[command(name = "scantool")]
#[command(about = "Inspect and export a scanlog record store")]
#[command(version)]
struct Args {
    /// Record file (defaults to storage.path from the configuration)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Path to scanlog configuration file
    #[arg(short = 'c', long, default_value = "scanlog.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show record counts and capacity usage
    Stats,
    /// Print records, newest first
    List {
        /// Only records not yet confirmed by the backend
        #[arg(long)]
        unsynced: bool,

        /// Maximum number of records to print
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Write every record as CSV or JSON
    Export {
        /// csv or json
        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = ScanlogConfig::load_from_file(&args.config).with_context(|| {
        format!("Failed to load configuration from {}", args.config.display())
    })?;
    let path = args
        .store
        .unwrap_or_else(|| PathBuf::from(&config.storage.path));

    // Opening creates missing files, which an inspection tool must not do
    if !path.exists() {
        bail!("Record store {} does not exist", path.display());
    }
    let store = RecordStore::open(&path, config.storage.max_records)
        .with_context(|| format!("Failed to open record store {}", path.display()))?;

    match args.command {
        Command::Stats => print_stats(&store),
        Command::List { unsynced, limit } => list_records(&store, unsynced, limit),
        Command::Export { format, output } => export_records(&store, format, output),
    }
}

fn print_stats(store: &RecordStore) -> Result<()> {
    let stats = store.stats()?;

    println!("Store:     {}", stats.storage_file);
    println!("Total:     {}", stats.total_records);
    println!("Synced:    {}", stats.synced_records);
    println!("Pending:   {}", stats.unsynced_records);
    println!(
        "Capacity:  {} ({:.1}% used)",
        stats.max_capacity,
        stats.usage_percent()
    );
    Ok(())
}

fn list_records(store: &RecordStore, unsynced: bool, limit: usize) -> Result<()> {
    let filter = unsynced.then_some(false);
    let records = export::select(store.all()?, filter);

    for record in records.iter().take(limit) {
        println!(
            "{}  {:<20} {:<16} {}",
            scanlog::record::format_timestamp(&record.timestamp),
            record.card_id,
            record.device_id,
            if record.synced { "synced" } else { "pending" }
        );
    }
    if records.len() > limit {
        println!("... {} more", records.len() - limit);
    }
    Ok(())
}

fn export_records(
    store: &RecordStore,
    format: ExportFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let records = export::select(store.all()?, None);
    let body = export::render(&records, format, Utc::now())?;

    match output {
        Some(path) => {
            std::fs::write(&path, body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Exported {} records to {}", records.len(), path.display());
            eprintln!("Exported {} records to {}", records.len(), path.display());
        }
        None => print!("{}", body),
    }
    Ok(())
}
