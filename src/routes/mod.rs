pub mod health;
pub mod local_store;
pub mod metrics;
pub mod status;
pub mod upload;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// API bodies are small JSON documents; media never passes through here.
const API_BODY_LIMIT: usize = 64 * 1024;

/// Build the HTTP router. Local-store routes are mounted only when the state
/// carries a local object store; `/metrics` only when a recorder is installed.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let api = Router::new()
        .route("/upload", post(upload::upload))
        .route("/status/{job_id}", get(status::get_status))
        .route("/results/{job_id}", get(status::get_results))
        .route("/jobs", get(status::list_jobs))
        .route("/health", get(health::health_check))
        .layer(RequestBodyLimitLayer::new(API_BODY_LIMIT));

    let mut app = api;
    if state.local_store.is_some() {
        let store = Router::new()
            .route(
                "/local-store/{*key}",
                put(local_store::put_object).get(local_store::get_object),
            )
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(state.config.max_upload_bytes));
        app = app.merge(store);
    }

    let mut app = app.with_state(state);
    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
