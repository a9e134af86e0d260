//! Dead-letters command implementation.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use spillway::storage::{Store, WorkStatus};

use super::{format_millis, open_store};
use crate::OutputFormat;

#[derive(Serialize)]
struct DeadLetter {
    id: u64,
    attempts: u32,
    last_error: Option<String>,
    updated_at: i64,
}

#[derive(Serialize)]
struct DeadLettersOutput {
    queue: String,
    items: Vec<DeadLetter>,
    total: usize,
}

pub fn run(db: &Path, queue: &str, limit: usize, format: OutputFormat) -> Result<()> {
    let store = open_store(db)?;
    let items = store.list_by_status(queue, WorkStatus::Failed, limit)?;

    let output = DeadLettersOutput {
        queue: queue.to_string(),
        total: items.len(),
        items: items
            .into_iter()
            .map(|item| DeadLetter {
                id: item.id.raw(),
                attempts: item.attempts,
                last_error: item.last_error,
                updated_at: item.updated_at,
            })
            .collect(),
    };

    match format {
        OutputFormat::Text => {
            if output.items.is_empty() {
                println!("No dead letters on '{}'.", output.queue);
            } else {
                println!("{:<20} {:>8} {:>16}  {}", "ID", "ATTEMPTS", "FAILED AT", "LAST ERROR");
                println!("{}", "-".repeat(72));
                for item in &output.items {
                    println!(
                        "{:<20} {:>8} {:>16}  {}",
                        item.id,
                        item.attempts,
                        format_millis(Some(item.updated_at)),
                        item.last_error.as_deref().unwrap_or("-")
                    );
                }
                println!();
                println!("Total: {} item(s)", output.total);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
