//! Group commit batch logic for high-throughput writes.
//!
//! A batch closes when either trigger fires first:
//! - the batch holds `max_batch_size` writes
//! - the oldest pending write has waited `max_batch_delay`

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// What the buffer does when the store rejects a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FlushFailurePolicy {
    /// Fail every write in the batch; the caller retries.
    #[default]
    AllOrNothing,
    /// Bisect the batch and retry the halves to isolate poison rows.
    /// Only safe for idempotent payloads.
    PartialReplay,
}

/// Configuration for batch commits.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Maximum number of writes in a batch
    pub max_batch_size: usize,
    /// Maximum age of the oldest pending write
    pub max_batch_delay: Duration,
    pub failure_policy: FlushFailurePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(5),
            failure_policy: FlushFailurePolicy::AllOrNothing,
        }
    }
}

/// Why a batch became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Delay,
    Forced,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Delay => "delay",
            Self::Forced => "forced",
        }
    }
}

/// Batch accumulator for write operations.
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    config: BatchConfig,
    items: Vec<T>,
    oldest: Option<Instant>,
}

impl<T> BatchAccumulator<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            items: Vec::with_capacity(config.max_batch_size),
            oldest: None,
        }
    }

    /// Add an item to the batch.
    ///
    /// Returns the trigger if the batch is now ready to flush.
    pub fn push(&mut self, item: T) -> Option<FlushReason> {
        self.oldest.get_or_insert_with(Instant::now);
        self.items.push(item);
        self.ready()
    }

    /// Which trigger, if any, has fired.
    pub fn ready(&self) -> Option<FlushReason> {
        if self.items.is_empty() {
            return None;
        }
        if self.items.len() >= self.config.max_batch_size {
            return Some(FlushReason::Size);
        }
        match self.oldest {
            Some(oldest) if oldest.elapsed() >= self.config.max_batch_delay => {
                Some(FlushReason::Delay)
            }
            _ => None,
        }
    }

    /// When the delay trigger fires for the current batch.
    ///
    /// Returns None if the batch is empty.
    pub fn deadline(&self) -> Option<Instant> {
        if self.items.is_empty() {
            return None;
        }
        self.oldest.map(|oldest| oldest + self.config.max_batch_delay)
    }

    /// Take the batch, leaving the accumulator empty.
    pub fn drain(&mut self) -> Vec<T> {
        self.oldest = None;
        std::mem::replace(
            &mut self.items,
            Vec::with_capacity(self.config.max_batch_size),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
