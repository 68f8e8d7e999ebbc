//! Metric families and Prometheus recorder installation.
//!
//! All metric names live here so the scheduler and HTTP layers agree on
//! them. The recorder is pull-based: the admin server renders the registry
//! on `GET /metrics`.

use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const SCHEDULER_RUNS_TOTAL: &str = "scheduler_runs_total";
pub const SCHEDULER_ENTRIES_PROCESSED_TOTAL: &str = "scheduler_entries_processed_total";
pub const SCHEDULER_BATCH_DURATION_SECONDS: &str = "scheduler_batch_duration_seconds";
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Count a scheduler run that aborted before completing.
pub fn record_run_error() {
    metrics::counter!(SCHEDULER_RUNS_TOTAL, "result" => "error").increment(1);
}

/// Install the process-wide Prometheus recorder. Call once, from the binary.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    metrics::describe_counter!(
        SCHEDULER_RUNS_TOTAL,
        "Scheduler runs, labeled by result (empty, completed, error)."
    );
    metrics::describe_counter!(
        SCHEDULER_ENTRIES_PROCESSED_TOTAL,
        "Enrollments processed by the scheduler, labeled by result."
    );
    metrics::describe_histogram!(
        SCHEDULER_BATCH_DURATION_SECONDS,
        "Wall-clock duration of one scheduler run."
    );
    metrics::describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Admin HTTP requests, labeled by method, path and status."
    );

    Ok(handle)
}
