//! Enqueue command implementation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use spillway::config::EngineConfig;
use spillway::storage::SqliteStore;
use spillway::Engine;

use crate::OutputFormat;

#[derive(Serialize)]
struct EnqueueOutput {
    id: u64,
    queue: String,
    payload_size: usize,
}

pub async fn run(
    db: &Path,
    queue: &str,
    payload: Option<String>,
    file: Option<PathBuf>,
    node_id: Option<u16>,
    format: OutputFormat,
) -> Result<()> {
    let payload_bytes = match (payload, file) {
        (Some(p), None) => p.into_bytes(),
        (None, Some(f)) => {
            fs::read(&f).with_context(|| format!("failed to read file: {}", f.display()))?
        }
        (Some(_), Some(_)) => {
            return Err(anyhow!("cannot specify both payload and --file"));
        }
        (None, None) => {
            use std::io::{self, Read};
            let mut buffer = Vec::new();
            io::stdin()
                .read_to_end(&mut buffer)
                .context("failed to read from stdin")?;
            buffer
        }
    };
    let payload_size = payload_bytes.len();

    if let Some(parent) = db.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(db, 2).with_context(|| format!("failed to open {}", db.display()))?;

    let config = EngineConfig {
        queue: queue.to_string(),
        node_id,
        ..EngineConfig::default()
    };
    let engine = Engine::open(config, Arc::new(store))?;
    let id = engine.enqueue(payload_bytes).await.context("enqueue failed")?;
    engine.shutdown().await?;

    let output = EnqueueOutput {
        id: id.raw(),
        queue: queue.to_string(),
        payload_size,
    };

    match format {
        OutputFormat::Text => {
            println!("Enqueued item on '{}'", output.queue);
            println!("  ID: {}", output.id);
            println!("  Payload size: {} bytes", output.payload_size);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
