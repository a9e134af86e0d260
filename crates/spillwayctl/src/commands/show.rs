//! Show command implementation.

use std::path::Path;

use anyhow::{bail, Result};
use serde::Serialize;
use spillway::storage::{Record, Store, WorkItem};
use spillway::Identifier;

use super::{format_millis, open_store};
use crate::OutputFormat;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ShowOutput {
    WorkItem(WorkItem),
    Record(Record),
}

pub fn run(db: &Path, raw_id: u64, format: OutputFormat) -> Result<()> {
    let store = open_store(db)?;
    let id = Identifier::from_raw(raw_id);

    let output = if let Some(item) = store.get_work_item(id)? {
        ShowOutput::WorkItem(item)
    } else if let Some(record) = store.get_record(id)? {
        ShowOutput::Record(record)
    } else {
        bail!("no work item or record with id {raw_id}");
    };

    match format {
        OutputFormat::Text => {
            println!("ID:          {id}");
            println!("Allocated:   {}", format_millis(Some(id.unix_millis() as i64)));
            println!("Node:        {}", id.node().get());
            match &output {
                ShowOutput::WorkItem(item) => {
                    println!("Kind:        work item");
                    println!("Queue:       {}", item.queue);
                    println!("Status:      {}", item.status);
                    println!("Attempts:    {}", item.attempts);
                    println!("Claimed by:  {}", item.claimed_by.as_deref().unwrap_or("-"));
                    println!("Expires at:  {}", format_millis(item.claim_expires_at));
                    println!("Last error:  {}", item.last_error.as_deref().unwrap_or("-"));
                    println!("Payload:     {}", String::from_utf8_lossy(&item.payload));
                }
                ShowOutput::Record(record) => {
                    println!("Kind:        record");
                    println!("Version:     {}", record.version);
                    println!("Status:      {}", record.status);
                    println!("Updated at:  {}", format_millis(Some(record.updated_at)));
                    println!("Payload:     {}", String::from_utf8_lossy(&record.payload));
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
