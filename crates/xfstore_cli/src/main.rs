//! xfstore CLI
//!
//! Maintenance tools for xfstore data directories.
//!
//! # Commands
//!
//! - `recover` - Open a data directory, running startup recovery
//! - `logs` - List leftover recovery logs without changing anything
//! - `in-doubt` - List distributed transactions awaiting their manager
//! - `forget` - Discard the recorded outcome of a distributed transaction

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// xfstore command-line tools.
#[derive(Parser)]
#[command(name = "xfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

/// How command results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the data directory and recover unfinished transactions
    Recover {
        /// Skip fsync after repairs
        #[arg(long)]
        no_sync: bool,
    },

    /// List leftover recovery logs without changing anything
    Logs,

    /// List distributed transactions awaiting a decision
    InDoubt,

    /// Discard the recorded outcome of a distributed transaction
    Forget {
        /// Transaction stem as found in xlog/, e.g. X1-6774-6231
        xid: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Recover { no_sync } => {
            let path = cli.path.ok_or("Data directory path required for recover")?;
            commands::recover::run(&path, !no_sync, cli.format)?;
        }
        Commands::Logs => {
            let path = cli.path.ok_or("Data directory path required for logs")?;
            commands::logs::run(&path, cli.format)?;
        }
        Commands::InDoubt => {
            let path = cli.path.ok_or("Data directory path required for in-doubt")?;
            commands::in_doubt::list(&path, cli.format)?;
        }
        Commands::Forget { xid } => {
            let path = cli.path.ok_or("Data directory path required for forget")?;
            commands::in_doubt::forget(&path, &xid)?;
        }
        Commands::Version => {
            println!("xfstore CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
