//! Configuration for Spillway.
//!
//! Supports:
//! - [`EngineConfig`]: the validated engine settings, deserializable with serde
//! - [`Config`]: CLI arguments with `SPILLWAY_*` environment overrides for
//!   the daemon, converted into an [`EngineConfig`]

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::id::{AllocatorConfig, ClockRollbackPolicy, NodeId, MAX_NODE};
use crate::queue::QueueConfig;
use crate::storage::{BatchConfig, FlushFailurePolicy, DEFAULT_QUEUE};
use crate::worker::WorkerConfig;

/// Error type for configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("node id {0} out of range (max 1023)")]
    InvalidNode(u16),

    #[error("max_poll_backoff ({backoff_ms} ms) is shorter than poll_interval ({interval_ms} ms)")]
    BackoffBelowInterval { backoff_ms: u64, interval_ms: u64 },

    #[error("queue name must not be empty")]
    EmptyQueue,
}

/// Serialize a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Writes per batch before a size-triggered flush
    pub max_batch_size: usize,
    /// Age of the oldest buffered write before a delay-triggered flush
    #[serde(with = "duration_ms")]
    pub max_batch_delay: Duration,
    /// Capacity of the buffer's submission channel (backpressure bound)
    pub write_channel_size: usize,
    pub flush_failure_policy: FlushFailurePolicy,
    /// Queue used by `enqueue` and pollers created without an explicit queue
    pub queue: String,
    #[serde(with = "duration_ms")]
    pub lease_duration: Duration,
    pub max_attempts: u32,
    pub claim_limit: usize,
    /// Node tag for identifiers; random when absent
    pub node_id: Option<u16>,
    pub clock_rollback: ClockRollbackPolicy,
    pub worker_count: usize,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub max_poll_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(5),
            write_channel_size: 1000,
            flush_failure_policy: FlushFailurePolicy::AllOrNothing,
            queue: DEFAULT_QUEUE.to_string(),
            lease_duration: Duration::from_secs(30),
            max_attempts: 5,
            claim_limit: 10,
            node_id: None,
            clock_rollback: ClockRollbackPolicy::default(),
            worker_count: 4,
            poll_interval: Duration::from_millis(100),
            max_poll_backoff: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("max_batch_size", self.max_batch_size),
            ("write_channel_size", self.write_channel_size),
            ("claim_limit", self.claim_limit),
            ("worker_count", self.worker_count),
            ("max_attempts", self.max_attempts as usize),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }

        let durations = [
            ("max_batch_delay", self.max_batch_delay),
            ("lease_duration", self.lease_duration),
            ("poll_interval", self.poll_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(field));
            }
        }

        if self.max_poll_backoff < self.poll_interval {
            return Err(ConfigError::BackoffBelowInterval {
                backoff_ms: self.max_poll_backoff.as_millis() as u64,
                interval_ms: self.poll_interval.as_millis() as u64,
            });
        }
        if let Some(node) = self.node_id {
            if node > MAX_NODE {
                return Err(ConfigError::InvalidNode(node));
            }
        }
        if self.queue.is_empty() {
            return Err(ConfigError::EmptyQueue);
        }
        Ok(())
    }

    /// The configured node tag, or a random one.
    pub fn node(&self) -> Result<NodeId, ConfigError> {
        match self.node_id {
            Some(node) => NodeId::new(node).map_err(|_| ConfigError::InvalidNode(node)),
            None => Ok(NodeId::random()),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_batch_delay: self.max_batch_delay,
            failure_policy: self.flush_failure_policy,
        }
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            rollback: self.clock_rollback,
            random_counter_start: self.node_id.is_none(),
            ..AllocatorConfig::default()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        self.queue_config_for(&self.queue)
    }

    pub fn queue_config_for(&self, queue: &str) -> QueueConfig {
        QueueConfig {
            queue: queue.to_string(),
            lease_duration: self.lease_duration,
            max_attempts: self.max_attempts,
            claim_limit: self.claim_limit,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_count: self.worker_count,
            poll_interval: self.poll_interval,
            max_poll_backoff: self.max_poll_backoff,
        }
    }
}

/// Clock rollback handling, as selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ClockRollbackMode {
    Block,
    Extend,
}

/// Spillway: batched persistence with a skip-locked work queue.
#[derive(Parser, Debug, Clone)]
#[command(name = "spillway")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Data directory for the SQLite database
    #[arg(short, long, env = "SPILLWAY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SPILLWAY_LOG_JSON")]
    pub log_json: bool,

    /// Queue the workers poll
    #[arg(short, long, env = "SPILLWAY_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Writes per batch
    #[arg(long, env = "SPILLWAY_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Maximum age of a buffered write before its batch is flushed
    #[arg(long, env = "SPILLWAY_BATCH_DELAY_MS", default_value_t = 5)]
    pub batch_delay_ms: u64,

    /// Size of the write channel (backpressure control)
    #[arg(long, env = "SPILLWAY_WRITE_CHANNEL_SIZE", default_value_t = 1000)]
    pub write_channel_size: usize,

    /// What to do when the store rejects a batch
    #[arg(long, env = "SPILLWAY_FLUSH_FAILURE_POLICY", value_enum, default_value_t = FlushFailurePolicy::AllOrNothing)]
    pub flush_failure_policy: FlushFailurePolicy,

    /// Size of the SQLite connection pool
    #[arg(long, env = "SPILLWAY_POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Claim lease in milliseconds
    #[arg(long, env = "SPILLWAY_LEASE_MS", default_value_t = 30_000)]
    pub lease_ms: u64,

    /// Claims after which an expired item is dead-lettered
    #[arg(long, env = "SPILLWAY_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Items per claim
    #[arg(long, env = "SPILLWAY_CLAIM_LIMIT", default_value_t = 10)]
    pub claim_limit: usize,

    /// Number of worker tasks
    #[arg(short, long, env = "SPILLWAY_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Idle poll interval in milliseconds
    #[arg(long, env = "SPILLWAY_POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// Cap on the idle poll backoff in milliseconds
    #[arg(long, env = "SPILLWAY_MAX_POLL_BACKOFF_MS", default_value_t = 5_000)]
    pub max_poll_backoff_ms: u64,

    /// Node tag for identifiers (0-1023); random when unset
    #[arg(long, env = "SPILLWAY_NODE_ID")]
    pub node_id: Option<u16>,

    /// Clock rollback handling for the identifier allocator
    #[arg(long, env = "SPILLWAY_CLOCK_ROLLBACK", value_enum, default_value_t = ClockRollbackMode::Block)]
    pub clock_rollback: ClockRollbackMode,

    /// Longest rollback the `block` mode waits out, in milliseconds
    #[arg(long, env = "SPILLWAY_CLOCK_ROLLBACK_MAX_WAIT_MS", default_value_t = 1_000)]
    pub clock_rollback_max_wait_ms: u64,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Path of the SQLite database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("spillway.db")
    }

    pub fn engine_config(&self) -> EngineConfig {
        let clock_rollback = match self.clock_rollback {
            ClockRollbackMode::Block => ClockRollbackPolicy::Block {
                max_wait: Duration::from_millis(self.clock_rollback_max_wait_ms),
            },
            ClockRollbackMode::Extend => ClockRollbackPolicy::Extend,
        };
        EngineConfig {
            max_batch_size: self.batch_size,
            max_batch_delay: Duration::from_millis(self.batch_delay_ms),
            write_channel_size: self.write_channel_size,
            flush_failure_policy: self.flush_failure_policy,
            queue: self.queue.clone(),
            lease_duration: Duration::from_millis(self.lease_ms),
            max_attempts: self.max_attempts,
            claim_limit: self.claim_limit,
            node_id: self.node_id,
            clock_rollback,
            worker_count: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_backoff: Duration::from_millis(self.max_poll_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.max_batch_delay, Duration::from_millis(5));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(
            config.clock_rollback,
            ClockRollbackPolicy::Block {
                max_wait: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig {
            max_batch_size: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("max_batch_size")));

        let config = EngineConfig {
            lease_duration: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("lease_duration")));

        let config = EngineConfig {
            node_id: Some(1024),
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidNode(1024)));

        let config = EngineConfig {
            max_poll_backoff: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffBelowInterval { .. })
        ));
    }

    #[test]
    fn test_random_node_gets_random_counter_start() {
        assert!(EngineConfig::default().allocator_config().random_counter_start);

        let pinned = EngineConfig {
            node_id: Some(12),
            ..EngineConfig::default()
        };
        assert!(!pinned.allocator_config().random_counter_start);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "max_batch_size": 50,
                "lease_duration": 2000,
                "flush_failure_policy": "partial_replay",
                "clock_rollback": { "policy": "extend" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.lease_duration, Duration::from_secs(2));
        assert_eq!(config.flush_failure_policy, FlushFailurePolicy::PartialReplay);
        assert_eq!(config.clock_rollback, ClockRollbackPolicy::Extend);
        assert_eq!(config.claim_limit, 10);
    }

    #[test]
    fn test_cli_converts_to_engine_config() {
        let config = Config::try_parse_from([
            "spillway",
            "--batch-size",
            "250",
            "--node-id",
            "7",
            "--clock-rollback",
            "extend",
            "--flush-failure-policy",
            "partial-replay",
        ])
        .unwrap();

        let engine = config.engine_config();
        engine.validate().unwrap();
        assert_eq!(engine.max_batch_size, 250);
        assert_eq!(engine.node().unwrap().get(), 7);
        assert_eq!(engine.clock_rollback, ClockRollbackPolicy::Extend);
        assert_eq!(engine.flush_failure_policy, FlushFailurePolicy::PartialReplay);
        assert_eq!(config.db_path(), PathBuf::from("./data/spillway.db"));
    }
}
