//! cardsync CLI
//!
//! Command-line tools for inspecting and maintaining a sync journal.
//!
//! # Commands
//!
//! - `queue` - List queued and in-flight operations
//! - `dead-letters` - List operations that exhausted their retries
//! - `conflicts` - List open conflicts, or resolved ones with `--history`
//! - `checkpoint` - Show sync timestamps and the remote delta cursor
//! - `requeue` - Put a dead letter back in the queue
//! - `compact` - Rewrite the journal without superseded records

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// cardsync journal tools.
#[derive(Parser)]
#[command(name = "cardsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync journal
    #[arg(global = true, short, long)]
    journal: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(global = true, long)]
    json: bool,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List queued and in-flight operations
    Queue,

    /// List dead-lettered operations
    DeadLetters,

    /// List open conflicts
    Conflicts {
        /// Show resolved conflicts instead
        #[arg(long)]
        history: bool,
    },

    /// Show sync timestamps and the delta cursor
    Checkpoint,

    /// Put a dead-lettered operation back in the queue
    Requeue {
        /// Operation id
        op_id: u64,
    },

    /// Rewrite the journal without superseded records
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let format = if cli.json {
        commands::Format::Json
    } else {
        commands::Format::Text
    };

    match cli.command {
        Commands::Queue => {
            let path = cli.journal.ok_or("Journal path required for queue")?;
            commands::queue::run(&path, false, format)?;
        }
        Commands::DeadLetters => {
            let path = cli.journal.ok_or("Journal path required for dead-letters")?;
            commands::queue::run(&path, true, format)?;
        }
        Commands::Conflicts { history } => {
            let path = cli.journal.ok_or("Journal path required for conflicts")?;
            commands::conflicts::run(&path, history, format)?;
        }
        Commands::Checkpoint => {
            let path = cli.journal.ok_or("Journal path required for checkpoint")?;
            commands::checkpoint::run(&path, format)?;
        }
        Commands::Requeue { op_id } => {
            let path = cli.journal.ok_or("Journal path required for requeue")?;
            commands::requeue::run(&path, op_id)?;
        }
        Commands::Compact => {
            let path = cli.journal.ok_or("Journal path required for compact")?;
            commands::compact::run(&path, format)?;
        }
        Commands::Version => {
            println!("cardsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
