//! tablesync CLI
//!
//! Runs the sync daemon and inspects or maintains its job ledger.
//!
//! # Commands
//!
//! - `run` - Start workers, reaper and sweepers until Ctrl-C
//! - `sync` - Run one sync job in the foreground
//! - `job` / `jobs` - Show job records
//! - `table-status` - Show the last known sync state of a table
//! - `tables` - Manage the table allow-list
//! - `reap` / `sweep` - Run one pass of the periodic maintenance tasks

mod commands;

use clap::{Parser, Subcommand};
use commands::{DataArgs, Format};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Warehouse-to-local table synchronization.
#[derive(Parser)]
#[command(name = "tablesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite job ledger
    #[arg(
        global = true,
        short,
        long,
        env = "TABLESYNC_LEDGER",
        default_value = "tablesync/ledger.db"
    )]
    ledger: PathBuf,

    /// Output format for read commands
    #[arg(global = true, short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync service and wait for Ctrl-C
    Run {
        #[command(flatten)]
        data: DataArgs,

        /// Number of worker threads
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Only sync tables on the active allow-list
        #[arg(long)]
        require_registration: bool,
    },

    /// Run one sync job in the foreground and print its record
    Sync {
        /// Source schema
        schema: String,

        /// Source table
        table: String,

        /// Sync incrementally on this watermark column
        #[arg(short, long)]
        incremental: Option<String>,

        #[command(flatten)]
        data: DataArgs,
    },

    /// Show one job
    Job {
        /// Job ID
        id: String,
    },

    /// List jobs, newest first
    Jobs {
        /// Only jobs in this status (pending, running, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of jobs
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show the last known sync state of a table
    TableStatus {
        /// Source schema
        schema: String,

        /// Source table
        table: String,
    },

    /// Manage the table allow-list
    Tables {
        #[command(subcommand)]
        action: TablesAction,
    },

    /// Fail running jobs with no recent progress
    Reap {
        /// Seconds without progress before a job is failed
        #[arg(long, default_value = "3600")]
        threshold_secs: u64,
    },

    /// Delete expired job records and orphaned staging directories
    Sweep {
        /// Root directory for staged files
        #[arg(long, env = "TABLESYNC_STAGING", default_value = "tablesync/staging")]
        staging: PathBuf,
    },
}

#[derive(Subcommand)]
enum TablesAction {
    /// Register a table after checking it exists in the source
    Add {
        /// Source schema
        schema: String,

        /// Source table
        table: String,

        #[command(flatten)]
        data: DataArgs,
    },

    /// Deactivate a table
    Remove {
        /// Source schema
        schema: String,

        /// Source table
        table: String,
    },

    /// List registered tables
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            data,
            workers,
            require_registration,
        } => {
            commands::run::run(&cli.ledger, &data, workers, require_registration)?;
        }
        Commands::Sync {
            schema,
            table,
            incremental,
            data,
        } => {
            commands::run::sync_once(
                &cli.ledger,
                &data,
                &schema,
                &table,
                incremental.as_deref(),
                cli.format,
            )?;
        }
        Commands::Job { id } => {
            commands::jobs::show(&cli.ledger, &id, cli.format)?;
        }
        Commands::Jobs { status, limit } => {
            commands::jobs::list(&cli.ledger, status.as_deref(), limit, cli.format)?;
        }
        Commands::TableStatus { schema, table } => {
            commands::jobs::table_status(&cli.ledger, &schema, &table, cli.format)?;
        }
        Commands::Tables { action } => match action {
            TablesAction::Add {
                schema,
                table,
                data,
            } => commands::tables::add(&cli.ledger, &data, &schema, &table, cli.format)?,
            TablesAction::Remove { schema, table } => {
                commands::tables::remove(&cli.ledger, &schema, &table)?
            }
            TablesAction::List => commands::tables::list(&cli.ledger, cli.format)?,
        },
        Commands::Reap { threshold_secs } => {
            commands::maintenance::reap(&cli.ledger, threshold_secs, cli.format)?;
        }
        Commands::Sweep { staging } => {
            commands::maintenance::sweep(&cli.ledger, &staging, cli.format)?;
        }
    }

    Ok(())
}
