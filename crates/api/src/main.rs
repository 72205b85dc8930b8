use std::sync::Arc;

use anyhow::Context;

use atelier_api::app::{AppServices, build_app};
use atelier_infra::config::PipelineConfig;
use atelier_infra::pipeline::{Pipeline, spawn_worker_pool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    atelier_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let pipeline = Pipeline::from_config(&config)
        .await
        .context("failed to initialise pipeline")?;

    let workers = spawn_worker_pool(pipeline.worker_context(), &config.workers);
    let app = build_app(Arc::new(AppServices::from_pipeline(&pipeline)));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    tracing::info!("http server stopped, draining workers");
    workers.shutdown().await;
    pipeline.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
