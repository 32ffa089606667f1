use anyhow::Context;
use quay_orchestrator::api;
use quay_orchestrator::config::Config;
use quay_orchestrator::orchestrator::Orchestrator;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quay_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Quay Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Heartbeat interval {:?}, cancel grace {:?}, overflow policy {:?}",
        config.heartbeat_interval,
        config.cancel_grace_period,
        config.overflow_policy
    );

    let addr = config.bind_addr.clone();
    let orchestrator = Arc::new(Orchestrator::new(config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = orchestrator.spawn(shutdown_rx.clone());

    // Build router with all API endpoints
    let app = api::create_router(Arc::clone(&orchestrator), shutdown_rx);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    tracing::info!("Orchestrator stopped");
    Ok(())
}
