//! sipsync CLI
//!
//! Command-line tools for inspecting and maintaining a sipsync cache file.
//!
//! # Commands
//!
//! - `inspect` - Display schema version, table sizes and queue counts
//! - `migrate` - Show or apply schema migrations
//! - `prefs` - Read and write stored preferences
//! - `queue` - List or clear the offline operation queue

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// sipsync cache maintenance tools.
#[derive(Parser)]
#[command(name = "sipsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the cache database file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display cache statistics and schema version
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show or apply schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Read and write stored preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },

    /// Inspect the offline operation queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// List registered migrations and whether they are applied
    Status,
    /// Apply pending migrations
    Run,
}

#[derive(Subcommand)]
enum PrefsAction {
    /// Print one preference
    Get {
        /// Preference key
        key: String,
    },
    /// Store a preference
    Set {
        /// Preference key
        key: String,
        /// New value
        value: String,
        /// Optional description kept with the value
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Print every preference
    List,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued operations, oldest first
    List {
        /// Maximum number of operations to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Remove every queued operation
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Migrate { action } => {
            let path = cli.path.ok_or("Database path required for migrate")?;
            match action {
                MigrateAction::Status => commands::migrate::status(&path)?,
                MigrateAction::Run => commands::migrate::run(&path).await?,
            }
        }
        Commands::Prefs { action } => {
            let path = cli.path.ok_or("Database path required for prefs")?;
            match action {
                PrefsAction::Get { key } => commands::prefs::get(&path, &key).await?,
                PrefsAction::Set {
                    key,
                    value,
                    description,
                } => commands::prefs::set(&path, &key, &value, description.as_deref()).await?,
                PrefsAction::List => commands::prefs::list(&path).await?,
            }
        }
        Commands::Queue { action } => {
            let path = cli.path.ok_or("Database path required for queue")?;
            match action {
                QueueAction::List { limit } => commands::queue::list(&path, limit).await?,
                QueueAction::Clear => commands::queue::clear(&path).await?,
            }
        }
        Commands::Version => {
            println!("sipsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("sipsync core v{}", sipsync_core::VERSION);
        }
    }

    Ok(())
}
