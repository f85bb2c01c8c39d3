//! Strata server binary
//!
//! ## Configuration
//! `STRATA_CONFIG` names an optional TOML file; `STRATA_*` variables override it
//! (see [`strata_server::config`]).
//!
//! ## Example Usage
//! ```bash
//! # Archive on the local filesystem (development)
//! STRATA_LOCAL_STORAGE_PATH=./data/archive cargo run -p strata-server
//!
//! # Archive in S3
//! STRATA_BUCKET=metrics-archive AWS_REGION=eu-west-1 cargo run -p strata-server --release
//! ```
//!
//! ## Logging
//! Controlled via `RUST_LOG` (default: `info`).

use std::path::PathBuf;

use anyhow::Context;
use strata_server::{create_router, ServerConfig, Strata};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("STRATA_CONFIG").ok().map(PathBuf::from);
    let config = ServerConfig::load(config_path.as_deref())?;
    info!(
        bind_addr = %config.bind_addr,
        data_dir = %config.store.data_dir.display(),
        object_store = ?config.object_store,
        "Starting Strata"
    );

    strata_observability::init();

    let mut strata = Strata::build(&config).await?;
    strata.spawn();

    let router = create_router(strata.state());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("Strata listening on {}", config.bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, shutting down background loops");
    strata.shutdown().await;
    info!("Strata shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
