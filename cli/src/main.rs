//! txhistory CLI: ingest router transactions and inspect the history store.
//!
//! # Commands
//! ```text
//! txhistory ingest     --fixture <replay.json> --config <pipeline.json> [--db <path>] [--follow]
//! txhistory reconcile  --fixture <replay.json> --config <pipeline.json> [--db <path>]
//! txhistory status     [--db <path>] [--config <pipeline.json>]
//! txhistory show       --signature <base58> [--db <path>]
//! txhistory quarantine [--db <path>]
//! txhistory info
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use txhistory_core::{CheckpointStore, HistoryStore, PipelineConfig, Signature};
use txhistory_storage::sqlite::SqliteStorage;

mod cmd_ingest;
mod logging;

#[derive(Parser)]
#[command(
    name = "txhistory",
    about = "Ingest, reconcile, and inspect router transaction history",
    long_about = "
Builds and maintains the router transaction-history table from a recorded
slot stream. The history lives in a SQLite file (tables tx_history,
tx_provisional, tx_quarantine, checkpoints).

ENVIRONMENT VARIABLES:
  RUST_LOG    Log filter directives (overrides --log-level)
",
    version
)]
struct Cli {
    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    /// Per-crate level override, e.g. `txhistory-core=debug` (repeatable)
    #[arg(long = "log-component", global = true, value_parser = logging::parse_component)]
    log_components: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a recorded slot stream into the history store
    Ingest {
        /// Recorded stream (JSON replay fixture)
        #[arg(long)]
        fixture: PathBuf,
        /// Pipeline configuration (JSON)
        #[arg(long)]
        config: PathBuf,
        /// SQLite database path
        #[arg(long, default_value = "./txhistory.db")]
        db: String,
        /// Keep polling and reconciling until Ctrl-C
        #[arg(long)]
        follow: bool,
    },

    /// Run one reconcile cycle against a recorded stream
    Reconcile {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "./txhistory.db")]
        db: String,
    },

    /// Show the pipeline checkpoint and table sizes
    Status {
        #[arg(long, default_value = "./txhistory.db")]
        db: String,
        /// Pipeline configuration; its id selects the checkpoint
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Look up one signature
    Show {
        /// Base58 transaction signature
        #[arg(long)]
        signature: String,
        #[arg(long, default_value = "./txhistory.db")]
        db: String,
    },

    /// List quarantined transactions
    Quarantine {
        #[arg(long, default_value = "./txhistory.db")]
        db: String,
    },

    /// Print the default pipeline configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_tracing(&logging::LogConfig {
        level: cli.log_level.clone(),
        components: cli.log_components.iter().cloned().collect(),
        json: cli.json_logs,
    });

    match cli.command {
        Commands::Ingest { fixture, config, db, follow } => {
            let config = load_config(&config)?;
            cmd_ingest::run(&fixture, &db, config, follow).await
        }

        Commands::Reconcile { fixture, config, db } => {
            let config = load_config(&config)?;
            cmd_ingest::reconcile(&fixture, &db, config).await
        }

        Commands::Status { db, config } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => PipelineConfig::default(),
            };
            cmd_status(&db, &config.id).await
        }

        Commands::Show { signature, db } => cmd_show(&db, &signature).await,

        Commands::Quarantine { db } => cmd_quarantine(&db).await,

        Commands::Info => cmd_info(),
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_json_file(path)
        .with_context(|| format!("loading pipeline config {}", path.display()))
}

async fn open_store(db: &str) -> Result<Arc<SqliteStorage>> {
    let store = SqliteStorage::open(db)
        .await
        .with_context(|| format!("opening history database {db}"))?;
    Ok(Arc::new(store))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_status(db: &str, pipeline_id: &str) -> Result<()> {
    let store = open_store(db).await?;
    let checkpoint = store.load(pipeline_id).await?;
    let rows = store.count().await?;
    let pending = store.provisional_after(0).await?.len();
    let quarantined = store.quarantined().await?.len();

    print_json(&serde_json::json!({
        "pipeline_id": pipeline_id,
        "checkpoint": checkpoint,
        "rows": rows,
        "provisional": pending,
        "quarantined": quarantined,
    }))
}

async fn cmd_show(db: &str, signature: &str) -> Result<()> {
    let signature = Signature::new(signature);
    if !signature.is_well_formed() {
        anyhow::bail!("'{signature}' is not a 64-byte base58 signature");
    }

    let store = open_store(db).await?;
    let record = store.get(&signature).await?;
    let state = store.state(&signature).await?;
    print_json(&serde_json::json!({
        "signature": signature,
        "state": state.to_string(),
        "record": record,
    }))
}

async fn cmd_quarantine(db: &str) -> Result<()> {
    let store = open_store(db).await?;
    let entries = store.quarantined().await?;
    if entries.is_empty() {
        eprintln!("no quarantined transactions");
    }
    print_json(&entries)
}

fn cmd_info() -> Result<()> {
    println!("txhistory v{}", env!("CARGO_PKG_VERSION"));
    println!("  Storage backends: memory, SQLite (this binary), Postgres (feature: postgres)");
    println!("  Default pipeline configuration:");
    print_json(&PipelineConfig::default())
}
