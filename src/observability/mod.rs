//! Observability for Spillway.
//!
//! Provides:
//! - Structured logging via `tracing-subscriber`
//! - OpenTelemetry metrics for flushes, claims, dead letters and conflicts,
//!   with optional OTLP export

pub mod metrics;
pub mod tracing;
