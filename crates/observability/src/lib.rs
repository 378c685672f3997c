//! Tracing/logging setup and job telemetry hook points (shared across crates).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;

/// Job lifecycle telemetry.
pub mod telemetry;

pub use telemetry::{MemorySink, TelemetryEvent, TelemetrySink, TracingSink};
