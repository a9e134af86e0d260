//! Status command implementation.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use spillway::storage::{StatusCounts, Store};

use super::open_store;
use crate::OutputFormat;

#[derive(Serialize)]
struct StatusOutput {
    queue: String,
    #[serde(flatten)]
    counts: StatusCounts,
    total: u64,
}

pub fn run(db: &Path, queue: &str, format: OutputFormat) -> Result<()> {
    let store = open_store(db)?;
    let counts = store.status_counts(queue)?;
    let output = StatusOutput {
        queue: queue.to_string(),
        counts,
        total: counts.total(),
    };

    match format {
        OutputFormat::Text => {
            println!("Queue '{}'", output.queue);
            println!("{:<10} {:>10}", "STATUS", "ITEMS");
            println!("{}", "-".repeat(21));
            println!("{:<10} {:>10}", "pending", counts.pending);
            println!("{:<10} {:>10}", "claimed", counts.claimed);
            println!("{:<10} {:>10}", "done", counts.done);
            println!("{:<10} {:>10}", "failed", counts.failed);
            println!();
            println!("Total: {} item(s)", output.total);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
