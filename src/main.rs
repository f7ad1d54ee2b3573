//! Binary entrypoint.
//! Boots the Axum HTTP server, the batch worker, and the Prometheus exporter.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use convo_insights::analyzer::{provider_from_config, AnalysisClient};
use convo_insights::api::{create_router, AppState};
use convo_insights::config::AppConfig;
use convo_insights::metrics::Metrics;
use convo_insights::store::{ConversationStore, MemoryStore};
use convo_insights::worker::BatchWorker;

/// Compact tracing output; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("convo_insights=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    // This enables INSIGHTS_CONFIG_PATH / GROK_API_KEY from .env.
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = AppConfig::load().context("loading service config")?;
    let metrics = Metrics::init();

    // --- Shared state ---
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
    let inbound_gate = config.inbound.build();
    let outbound_gate = config.outbound.build();

    let provider = provider_from_config(&config.analyzer)?;
    let client = Arc::new(AnalysisClient::new(
        provider,
        outbound_gate,
        &config.analyzer,
    ));
    info!(provider = client.provider_name(), "analysis provider ready");

    let worker = BatchWorker::new(Arc::clone(&store), client, config.worker);
    worker.start();

    let state = AppState {
        store,
        inbound_gate,
    };
    let app = create_router(state).merge(metrics.router());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "conversation insights service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Let in-flight batch work land before exiting.
    worker.stop().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
