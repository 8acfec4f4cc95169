use anyhow::Context;

use audioflow_api::app::{build_app, services::build_pipeline};
use audioflow_infra::config::PipelineConfig;
use audioflow_infra::workers::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; a malformed one is not.
    let loaded_env = dotenvy::dotenv().map(|_| true).or_else(|err| match err {
        dotenvy::Error::Io(_) => Ok(false),
        other => Err(other),
    })?;

    audioflow_observability::init();
    tracing::debug!(loaded_env, "environment loaded");

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    if config.jwt_secret == PipelineConfig::default().jwt_secret {
        tracing::warn!("AUDIOFLOW_JWT_SECRET not set; using insecure dev default");
    }

    let pipeline = build_pipeline(&config).await.context("failed to start pipeline")?;

    let workers = WorkerPool::spawn(pipeline.worker, config.worker_count);
    let sweeper = pipeline.sweeper.spawn(config.sweep_interval);

    let app = build_app(pipeline.services);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, workers = config.worker_count, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down background tasks");
    let stats = workers.stats();
    workers.shutdown().await;
    sweeper.shutdown().await;
    tracing::info!(?stats, "stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
