use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use media_pipeline::app_state::AppState;
use media_pipeline::config::{AppConfig, BackendMode};
use media_pipeline::routes;
use media_pipeline::services::sweeper::Sweeper;
use media_pipeline::services::worker::WorkerPool;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let mode = config.backend_mode;
    let bind_addr = config.bind_addr.clone();

    tracing::info!(backend_mode = %mode, "Initializing media-pipeline server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    routes::metrics::describe();

    let state = match mode {
        BackendMode::Local => AppState::local(config),
        BackendMode::Cloud => AppState::cloud(config)
            .await
            .expect("Failed to initialize cloud backends"),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Local mode has no separate worker or sweeper processes.
    let background = if mode == BackendMode::Local {
        tracing::info!(
            workers = state.config.worker_concurrency,
            "Starting in-process worker pool and sweeper"
        );
        let pool = WorkerPool::spawn(
            state.jobs.clone(),
            state.queue.clone(),
            state.storage.clone(),
            state.analyzer.clone(),
            state.config.worker_settings(),
            shutdown_rx.clone(),
        );
        let sweeper = Sweeper::new(
            state.jobs.clone(),
            state.queue.clone(),
            state.config.sweep_policy(),
        );
        let sweeper = tokio::spawn(sweeper.run(state.config.sweep_interval(), shutdown_rx.clone()));
        Some((pool, sweeper))
    } else {
        None
    };

    let app = routes::router(state, Some(Arc::new(prometheus_handle)));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Could not listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    let _ = shutdown_tx.send(true);
    if let Some((pool, sweeper)) = background {
        pool.join().await;
        if let Err(e) = sweeper.await {
            tracing::error!(error = %e, "Sweeper task panicked");
        }
    }
    tracing::info!("Server stopped");
}
