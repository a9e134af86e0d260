//! Subcommand implementations.

pub mod dead_letters;
pub mod enqueue;
pub mod show;
pub mod status;

use anyhow::{Context, Result};
use spillway::storage::SqliteStore;
use std::path::Path;

/// Open an existing database; refuses to create one by accident.
pub fn open_store(db: &Path) -> Result<SqliteStore> {
    if !db.exists() {
        anyhow::bail!("database not found: {}", db.display());
    }
    SqliteStore::open(db, 2).with_context(|| format!("failed to open {}", db.display()))
}

/// Unix milliseconds as seconds, or `-` for unset.
pub fn format_millis(millis: Option<i64>) -> String {
    match millis {
        None | Some(0) => "-".to_string(),
        Some(ms) => format!("{}.{:03}", ms / 1000, ms % 1000),
    }
}
