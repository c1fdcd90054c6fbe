//! Metrics collection and Prometheus export.
//!
//! Initializes the metrics exporter and provides the /metrics endpoint
//! handler. Recording helpers are no-ops until a recorder is installed,
//! which keeps tests free of global state.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

pub const INGESTION_TOTAL: &str = "statement_ingestion_total";
pub const INGESTION_DURATION: &str = "statement_ingestion_duration_seconds";
pub const EXTRACTION_DURATION: &str = "statement_extraction_duration_seconds";
pub const ROWS_DROPPED: &str = "statement_rows_dropped_total";
pub const QUEUE_ACTIVE: &str = "statement_queue_active";
pub const ENQUEUE_FAILURES: &str = "statement_enqueue_failures_total";
pub const DB_QUERY_DURATION: &str = "statement_db_query_duration_seconds";

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Calling it again is a no-op.
pub fn init_metrics() -> anyhow::Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    // A concurrent initializer may have won; its handle is equivalent
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

/// Get the current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// Times one database operation into [`DB_QUERY_DURATION`].
pub struct QueryTimer {
    operation: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn observe(self) {
        metrics::histogram!(DB_QUERY_DURATION, "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
    }
}

pub fn record_ingestion(status: &'static str, elapsed_secs: f64) {
    metrics::counter!(INGESTION_TOTAL, "status" => status).increment(1);
    metrics::histogram!(INGESTION_DURATION, "status" => status).record(elapsed_secs);
}

pub fn record_extraction(provider: &'static str, elapsed_secs: f64) {
    metrics::histogram!(EXTRACTION_DURATION, "provider" => provider).record(elapsed_secs);
}

pub fn record_dropped_rows(reason: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!(ROWS_DROPPED, "reason" => reason).increment(count as u64);
    }
}

pub fn set_queue_active(active: usize) {
    metrics::gauge!(QUEUE_ACTIVE).set(active as f64);
}

pub fn record_enqueue_failure() {
    metrics::counter!(ENQUEUE_FAILURES).increment(1);
}
