use chrono::Utc;
use media_pipeline::{
    app_state::AppState,
    config::{AppConfig, BackendMode},
    services::sweeper::Sweeper,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Retention and recovery for cloud deployments. With `SWEEP_ONCE=true` a
/// single pass runs and the process exits, for use from a scheduler.
#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    if config.backend_mode != BackendMode::Cloud {
        tracing::error!("The sweeper binary requires BACKEND_MODE=cloud; local mode sweeps in-process");
        std::process::exit(2);
    }
    let once = config.sweep_once;

    let state = AppState::cloud(config)
        .await
        .expect("Failed to initialize cloud backends");
    let sweeper = Sweeper::new(
        state.jobs.clone(),
        state.queue.clone(),
        state.config.sweep_policy(),
    );

    if once {
        match sweeper.sweep(Utc::now()).await {
            Ok(report) => tracing::info!(?report, "Sweep complete"),
            Err(e) => {
                tracing::error!(error = %e, "Sweep failed");
                std::process::exit(1);
            }
        }
        return;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(sweeper.run(state.config.sweep_interval(), shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Could not listen for shutdown signal");
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = task.await {
        tracing::error!(error = %e, "Sweeper task panicked");
    }
}
