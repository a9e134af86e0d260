//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - spillway_batches_flushed_total: Counter of store batch writes, by outcome
//! - spillway_batch_size: Histogram of rows per flushed batch
//! - spillway_flush_latency_seconds: Histogram of batch write latency
//! - spillway_ids_allocated_total: Counter of identifiers issued
//! - spillway_clock_rollbacks_total: Counter of allocations that found the clock behind, by policy
//! - spillway_items_claimed_total: Counter of work items claimed, by queue
//! - spillway_dead_letters_total: Counter of items moved to failed, by queue
//! - spillway_version_conflicts_total: Counter of rejected guarded updates
//! - spillway_leases_lost_total: Counter of completions rejected by the fence

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Spillway metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub batches_flushed: Counter<u64>,
    pub batch_size: Histogram<u64>,
    pub flush_latency: Histogram<f64>,
    pub ids_allocated: Counter<u64>,
    pub clock_rollbacks: Counter<u64>,
    pub items_claimed: Counter<u64>,
    pub dead_letters: Counter<u64>,
    pub version_conflicts: Counter<u64>,
    pub leases_lost: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            batches_flushed: meter
                .u64_counter("spillway_batches_flushed_total")
                .with_description("Store batch writes, labelled by outcome")
                .with_unit("1")
                .init(),
            batch_size: meter
                .u64_histogram("spillway_batch_size")
                .with_description("Rows per flushed batch")
                .with_unit("1")
                .init(),
            flush_latency: meter
                .f64_histogram("spillway_flush_latency_seconds")
                .with_description("Batch write latency including replay")
                .with_unit("s")
                .init(),
            ids_allocated: meter
                .u64_counter("spillway_ids_allocated_total")
                .with_description("Identifiers issued by this process")
                .with_unit("1")
                .init(),
            clock_rollbacks: meter
                .u64_counter("spillway_clock_rollbacks_total")
                .with_description("Allocations that observed the wall clock behind the last issued timestamp")
                .with_unit("1")
                .init(),
            items_claimed: meter
                .u64_counter("spillway_items_claimed_total")
                .with_description("Work items claimed")
                .with_unit("1")
                .init(),
            dead_letters: meter
                .u64_counter("spillway_dead_letters_total")
                .with_description("Work items moved to failed")
                .with_unit("1")
                .init(),
            version_conflicts: meter
                .u64_counter("spillway_version_conflicts_total")
                .with_description("Guarded updates rejected on version mismatch")
                .with_unit("1")
                .init(),
            leases_lost: meter
                .u64_counter("spillway_leases_lost_total")
                .with_description("Completions rejected because the claim was taken over")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, using no-op metrics");
                    install_manual_reader();
                }
            }
        } else {
            install_manual_reader();
        }

        let meter = global::meter("spillway");
        Metrics::new(&meter)
    });
}

/// Record into an in-process reader that nothing exports.
fn install_manual_reader() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record one batch write attempt.
pub fn record_flush(batch_size: usize, failed: bool, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("outcome", if failed { "failed" } else { "ok" })];
        m.batches_flushed.add(1, &attrs);
        m.batch_size.record(batch_size as u64, &attrs);
        m.flush_latency.record(latency_seconds, &attrs);
    }
}

pub fn record_id_allocated() {
    if let Some(m) = METRICS.get() {
        m.ids_allocated.add(1, &[]);
    }
}

/// Record one allocation that found the clock behind, by rollback policy.
pub fn record_clock_rollback(policy: &'static str) {
    if let Some(m) = METRICS.get() {
        m.clock_rollbacks.add(1, &[KeyValue::new("policy", policy)]);
    }
}

/// Record the outcome of one claim.
pub fn record_claim(queue: &str, claimed: usize, dead_lettered: usize) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("queue", queue.to_string())];
        if claimed > 0 {
            m.items_claimed.add(claimed as u64, &attrs);
        }
        if dead_lettered > 0 {
            m.dead_letters.add(dead_lettered as u64, &attrs);
        }
    }
}

/// Record items failed explicitly by their holder.
pub fn record_dead_letters(queue: &str, count: usize) {
    if let Some(m) = METRICS.get() {
        m.dead_letters
            .add(count as u64, &[KeyValue::new("queue", queue.to_string())]);
    }
}

pub fn record_version_conflict() {
    if let Some(m) = METRICS.get() {
        m.version_conflicts.add(1, &[]);
    }
}

pub fn record_lease_lost(queue: &str) {
    if let Some(m) = METRICS.get() {
        m.leases_lost
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }
}
