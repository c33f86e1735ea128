use media_pipeline::{
    app_state::AppState,
    config::{AppConfig, BackendMode},
    routes,
    services::worker::WorkerPool,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting media analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    if config.backend_mode != BackendMode::Cloud {
        // Local-mode queues live inside the API process.
        tracing::error!("The worker binary requires BACKEND_MODE=cloud; local mode runs workers in-process");
        std::process::exit(2);
    }

    PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus exporter");
    routes::metrics::describe();

    let state = AppState::cloud(config)
        .await
        .expect("Failed to initialize cloud backends");
    let settings = state.config.worker_settings();

    tracing::info!(
        concurrency = settings.concurrency,
        max_attempts = settings.max_attempts,
        lease_secs = settings.lease.as_secs(),
        "Worker ready, starting job processing loop"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::spawn(
        state.jobs.clone(),
        state.queue.clone(),
        state.storage.clone(),
        state.analyzer.clone(),
        settings,
        shutdown_rx,
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Could not listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received, finishing in-flight jobs");
    let _ = shutdown_tx.send(true);
    pool.join().await;
    tracing::info!("Worker stopped");
}
