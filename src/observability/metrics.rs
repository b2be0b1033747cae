//! # Metrics
//!
//! Prometheus metrics for pipeline and sync activity.
//!
//! ## Metrics Exposed
//!
//! - `secret_sync_jobs_total` - Total number of sync jobs processed
//! - `secret_sync_job_errors_total` - Total number of failed sync jobs
//! - `secret_sync_job_duration_seconds` - Duration of sync jobs
//! - `secret_sync_secrets_processed_total` - Secrets processed across jobs
//! - `secret_sync_store_operations_total` - Store operations by driver/kind
//! - `secret_sync_store_operation_duration_seconds` - Store operation latency

use std::sync::LazyLock;

use prometheus::{CounterVec, Histogram, HistogramVec, IntCounter, IntCounterVec, Registry};

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static JOBS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("secret_sync_jobs_total", "Total number of sync jobs processed"),
        &["namespace", "name", "status"],
    )
    .expect("Failed to create JOBS_TOTAL metric - this should never happen")
});

static JOB_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_sync_job_errors_total",
            "Total number of failed sync jobs",
        ),
        &["namespace", "name"],
    )
    .expect("Failed to create JOB_ERRORS_TOTAL metric - this should never happen")
});

static JOB_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "secret_sync_job_duration_seconds",
            "Duration of sync jobs in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create JOB_DURATION metric - this should never happen")
});

static SECRETS_PROCESSED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "secret_sync_secrets_processed_total",
        "Total number of secrets processed across sync jobs",
    )
    .expect("Failed to create SECRETS_PROCESSED_TOTAL metric - this should never happen")
});

static STORE_OPERATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    CounterVec::new(
        prometheus::Opts::new(
            "secret_sync_store_operations_total",
            "Total number of store operations",
        ),
        &["driver", "operation"],
    )
    .expect("Failed to create STORE_OPERATIONS_TOTAL metric - this should never happen")
});

static STORE_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "secret_sync_store_operation_duration_seconds",
            "Duration of store operations in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        &["driver", "operation"],
    )
    .expect("Failed to create STORE_OPERATION_DURATION metric - this should never happen")
});

/// Registers all metrics with the process registry. Safe to call more than
/// once; duplicate registration is ignored.
pub fn register() {
    let _ = REGISTRY.register(Box::new(JOBS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(SECRETS_PROCESSED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORE_OPERATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORE_OPERATION_DURATION.clone()));
}

pub fn observe_job(namespace: &str, name: &str, status: &str, seconds: f64) {
    JOBS_TOTAL
        .with_label_values(&[namespace, name, status])
        .inc();
    JOB_DURATION.observe(seconds);
}

pub fn observe_job_error(namespace: &str, name: &str) {
    JOB_ERRORS_TOTAL.with_label_values(&[namespace, name]).inc();
}

pub fn add_secrets_processed(count: u64) {
    SECRETS_PROCESSED_TOTAL.inc_by(count);
}

pub fn record_store_operation(driver: &str, operation: &str, seconds: f64) {
    STORE_OPERATIONS_TOTAL
        .with_label_values(&[driver, operation])
        .inc();
    STORE_OPERATION_DURATION
        .with_label_values(&[driver, operation])
        .observe(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        register();
        register();
        record_store_operation("aws", "create", 0.2);
        observe_job("pipeline", "sync-Stg", "success", 1.5);
        add_secrets_processed(3);
    }
}
