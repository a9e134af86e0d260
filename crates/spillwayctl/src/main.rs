//! spillwayctl: operator CLI for Spillway queues.
//!
//! Works directly against the SQLite database file: enqueue work, inspect
//! queue depth, list dead letters and show single rows.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Operator command-line interface for Spillway.
#[derive(Parser)]
#[command(name = "spillwayctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the Spillway SQLite database
    #[arg(long, env = "SPILLWAY_DB", default_value = "./data/spillway.db")]
    db: PathBuf,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {s}")),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a work item
    Enqueue {
        /// Message payload (or use --file, or stdin)
        payload: Option<String>,
        /// Read payload from file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Queue name
        #[arg(short, long, default_value = "default")]
        queue: String,
        /// Node tag for the allocated identifier (random when unset)
        #[arg(long, env = "SPILLWAY_NODE_ID")]
        node_id: Option<u16>,
    },
    /// Show item counts per status
    Status {
        /// Queue name
        #[arg(short, long, default_value = "default")]
        queue: String,
    },
    /// List dead-lettered items
    DeadLetters {
        /// Queue name
        #[arg(short, long, default_value = "default")]
        queue: String,
        /// Maximum number of items to list
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Show a work item or record by identifier
    Show {
        /// Identifier
        id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue {
            payload,
            file,
            queue,
            node_id,
        } => {
            commands::enqueue::run(&cli.db, &queue, payload, file, node_id, cli.output).await?;
        }
        Commands::Status { queue } => commands::status::run(&cli.db, &queue, cli.output)?,
        Commands::DeadLetters { queue, limit } => {
            commands::dead_letters::run(&cli.db, &queue, limit, cli.output)?;
        }
        Commands::Show { id } => commands::show::run(&cli.db, id, cli.output)?,
    }

    Ok(())
}
