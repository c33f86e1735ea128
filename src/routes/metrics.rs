use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the pipeline emits.
pub fn describe() {
    metrics::describe_counter!("upload_requests_total", "Pre-signed upload URLs issued");
    metrics::describe_counter!("uploads_confirmed_total", "Uploads confirmed and queued");
    metrics::describe_counter!("jobs_completed_total", "Jobs that reached completed");
    metrics::describe_counter!("jobs_failed_total", "Jobs that reached failed");
    metrics::describe_counter!("job_retries_total", "Failed attempts sent back to queued");
    metrics::describe_counter!(
        "duplicate_deliveries_total",
        "Queue deliveries dropped by the processing guard"
    );
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time spent in one processing attempt"
    );
    metrics::describe_gauge!("work_queue_depth", "Messages waiting in the work queue");
    metrics::describe_counter!(
        "sweeper_abandoned_total",
        "Abandoned pending_upload jobs purged past their TTL"
    );
    metrics::describe_gauge!(
        "sweeper_abandoned_pending",
        "pending_upload jobs past their TTL seen by the last sweep"
    );
    metrics::describe_counter!(
        "sweeper_recovered_total",
        "Stalled or stranded jobs moved back onto the queue"
    );
}
