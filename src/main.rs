use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use countme::config::Config;
use countme::export::{self, ExportFormat};
use countme::matcher::MatchMode;
use countme::pipeline::{self, IngestOptions};
use countme::storage::{
    SqliteMirrorStore, SqliteRawStore, SqliteTotalsStore, StorageError, TotalsStore,
};
use countme::totals::{update_totals, TotalsOptions};

#[derive(Parser)]
#[command(name = "countme")]
#[command(about = "Parse Fedora mirror access logs and aggregate weekly countme totals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MatchModeArg {
    /// Countme lines (libdnf/rpm-ostree requests on /metalink|/mirrorlist)
    Countme,
    /// All mirrorlist/metalink hits regardless of client
    Mirrors,
}

impl From<MatchModeArg> for MatchMode {
    fn from(arg: MatchModeArg) -> Self {
        match arg {
            MatchModeArg::Countme => MatchMode::Countme,
            MatchModeArg::Mirrors => MatchMode::Mirrors,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Csv,
    Json,
    Awk,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
            FormatArg::Awk => ExportFormat::Awk,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse access_log files into structured raw data
    Parse {
        /// access_log file(s) to parse (plain, .gz or .xz)
        #[arg(required = true, value_name = "LOG")]
        logs: Vec<PathBuf>,

        /// Write matched items to this SQLite database
        #[arg(long, value_name = "DBFILE", conflicts_with = "format", required_unless_present = "format")]
        sqlite: Option<PathBuf>,

        /// Write matched items to stdout in a text format instead
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,

        /// Which lines to match
        #[arg(long, value_enum, default_value = "countme")]
        matchmode: MatchModeArg,

        /// No header at the start of csv/awk output
        #[arg(long)]
        no_header: bool,

        /// Skip the check for already-ingested log data
        #[arg(long)]
        no_dup_check: bool,

        /// Do not (re)build the timestamp index after ingestion
        #[arg(long)]
        no_index: bool,

        /// Show progress while parsing
        #[arg(long)]
        progress: bool,
    },

    /// Aggregate raw countme data into weekly totals
    Totals {
        /// Database containing countme_totals
        countme_totals: PathBuf,

        /// Update totals from raw data (produced by `countme parse --sqlite`)
        #[arg(long = "update-from", value_name = "COUNTME_RAW_DB")]
        update_from: Option<PathBuf>,

        /// File to dump CSV-formatted totals data to
        #[arg(long, value_name = "CSV_FILE")]
        csv_dump: Option<PathBuf>,

        /// Show progress while counting
        #[arg(long)]
        progress: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("{err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// Fatal conditions terminate with a distinguishable status: a schema
/// mismatch is an operator error, not a runtime failure.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StorageError>() {
        Some(StorageError::SchemaMismatch { .. }) => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;

    match cli.command {
        Commands::Parse {
            logs,
            sqlite,
            format,
            matchmode,
            no_header,
            no_dup_check,
            no_index,
            progress,
        } => {
            let mode = MatchMode::from(matchmode);
            if let Some(db) = sqlite {
                let opts = IngestOptions {
                    dupcheck: !no_dup_check,
                    index: !no_index,
                    progress,
                };
                let stats = match mode {
                    MatchMode::Countme => {
                        let store = SqliteRawStore::open(&db, config.db_max_connections).await?;
                        pipeline::ingest_countme(&logs, &store, &opts).await?
                    }
                    MatchMode::Mirrors => {
                        let store = SqliteMirrorStore::open(&db, config.db_max_connections).await?;
                        pipeline::ingest_mirrors(&logs, &store, &opts).await?
                    }
                };
                info!(
                    files = stats.files,
                    matched = stats.matched,
                    inserted = stats.inserted,
                    duplicates = stats.duplicates,
                    "parse finished"
                );
            } else if let Some(format) = format {
                export::export_logs(
                    &logs,
                    mode,
                    ExportFormat::from(format),
                    !no_header,
                    std::io::stdout().lock(),
                )?;
            }
            Ok(())
        }

        Commands::Totals {
            countme_totals,
            update_from,
            csv_dump,
            progress,
        } => {
            let totals = SqliteTotalsStore::open(&countme_totals, config.db_max_connections).await?;
            totals.init().await?;

            if let Some(raw_db) = update_from {
                let raw = SqliteRawStore::open_existing(&raw_db, config.db_max_connections).await?;
                let opts = TotalsOptions {
                    jitter_window_secs: config.jitter_window_secs,
                    progress,
                };
                let stats = update_totals(&raw, &totals, &opts).await?;
                info!(
                    countme_weeks = stats.countme_weeks,
                    countme_buckets = stats.countme_buckets,
                    unique_weeks = stats.unique_weeks,
                    unique_buckets = stats.unique_buckets,
                    "totals updated"
                );
            }

            if let Some(csv_path) = csv_dump {
                let items = totals.all_items().await?;
                let file = std::fs::File::create(&csv_path).with_context(|| {
                    format!("failed to create CSV dump file {}", csv_path.display())
                })?;
                export::dump_totals_csv(file, &items)?;
                info!(rows = items.len(), path = %csv_path.display(), "wrote totals CSV");
            }
            Ok(())
        }
    }
}
