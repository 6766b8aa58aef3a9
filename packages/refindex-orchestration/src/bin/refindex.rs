//! Reference index CLI
//!
//! # Usage
//!
//! ```bash
//! # Reconcile every eligible table
//! refindex --config refindex.yaml update
//!
//! # Reconcile two tables, machine-readable output
//! refindex --config refindex.yaml update --table pages --table tt_content --format json
//!
//! # Show eligible tables and what the index currently holds
//! refindex --config refindex.yaml tables
//! ```
//!
//! Exit codes: 0 clean run, 1 run finished with errors, 2 fatal.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use refindex_orchestration::{
    IndexReconciliationRun, ReconcileConfig, RunResult, UpdateRefIndexTask,
};
use refindex_storage::{ReferenceIndexStore, SqliteReferenceIndex, TableCatalog, TableName};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

const EXIT_CLEAN: u8 = 0;
const EXIT_ERRORS: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[derive(Parser)]
#[command(name = "refindex")]
#[command(about = "Reconcile the reference index with its source tables", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE", global = true, default_value = "refindex.yaml")]
    config: PathBuf,

    /// SQLite database (overrides `database` in the config)
    #[arg(long, value_name = "PATH", global = true)]
    database: Option<PathBuf>,

    /// Raise log level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the index
    Update {
        /// Table to reconcile (repeatable); default is the config selection
        #[arg(short, long = "table", value_name = "TABLE")]
        tables: Vec<String>,

        /// Reconcile every eligible table
        #[arg(long, conflicts_with = "tables")]
        all: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List eligible tables and tables present in the index
    Tables,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn setup_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file, letting `--database` win over its `database`
fn load_config(path: &Path, database: Option<PathBuf>) -> anyhow::Result<ReconcileConfig> {
    let mut config = ReconcileConfig::from_yaml(path)
        .with_context(|| format!("cannot load config {}", path.display()))?;
    if let Some(database) = database {
        config.database = Some(database);
    }
    Ok(config)
}

/// Task for `update`: `--all` beats the config, `--table` replaces its selection
fn task_for(
    config: &ReconcileConfig,
    all: bool,
    tables: Vec<String>,
) -> anyhow::Result<UpdateRefIndexTask> {
    let mut task = UpdateRefIndexTask::from_config(config);
    if all {
        task.set_update_all_tables(true);
    } else if !tables.is_empty() {
        let selection = tables
            .into_iter()
            .map(TableName::new)
            .collect::<Result<Vec<_>, _>>()?;
        task.set_selected_tables(selection);
    }
    Ok(task)
}

fn exit_code(result: &RunResult) -> u8 {
    if result.is_clean() {
        EXIT_CLEAN
    } else {
        EXIT_ERRORS
    }
}

async fn execute(cli: Cli) -> anyhow::Result<u8> {
    let config = load_config(&cli.config, cli.database)?;

    let database = config
        .database
        .clone()
        .context("no database configured (set `database` or pass --database)")?;
    let store = SqliteReferenceIndex::open(&database, config.layout()?)
        .with_context(|| format!("cannot open database {}", database.display()))?;

    match cli.command {
        Commands::Tables => {
            list_tables(&config, &store).await?;
            Ok(EXIT_CLEAN)
        }
        Commands::Update {
            tables,
            all,
            format,
        } => {
            let task = task_for(&config, all, tables)?;

            let builder = store.record_builder(config.registry());
            let run = IndexReconciliationRun::new(
                Arc::new(config.registry().clone()),
                Arc::new(store),
                Arc::new(builder),
                config.run_options(),
            );

            let result = task.execute(&run).await?;
            match format {
                OutputFormat::Text => print_text(&result),
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&result.summary())?)
                }
            }

            Ok(exit_code(&result))
        }
    }
}

async fn list_tables(config: &ReconcileConfig, store: &SqliteReferenceIndex) -> anyhow::Result<()> {
    let eligible: BTreeSet<TableName> = config
        .registry()
        .list_eligible_tables()
        .await?
        .into_iter()
        .collect();
    let indexed = store.indexed_tables().await?;

    println!("Eligible tables:");
    for table in &eligible {
        println!("  {}", table);
    }

    let orphaned: Vec<&TableName> = indexed.iter().filter(|t| !eligible.contains(*t)).collect();
    if !orphaned.is_empty() {
        println!("Indexed but not eligible (swept on next update):");
        for table in orphaned {
            println!("  {}", table);
        }
    }
    Ok(())
}

fn print_text(result: &RunResult) {
    let summary = result.summary();
    println!(
        "Run {}: {} of {} tables reconciled, {} rows swept in {}ms",
        summary.run_id,
        summary.tables.len(),
        summary.working_set.len(),
        summary.swept_rows,
        summary.duration_ms
    );
    for table in &summary.tables {
        println!(
            "  {:<32} live={} rebuilt={} failed={} stale={} rows_deleted={}",
            table.table.as_str(),
            table.live_records,
            table.rebuilt,
            table.build_failures,
            table.stale_removed,
            table.rows_deleted
        );
    }
    for table in &summary.ignored_selection {
        println!("  ignored {} (not eligible)", table);
    }
    for e in &summary.errors {
        println!("  error [{}] {}", e.category, e.message);
    }
}
