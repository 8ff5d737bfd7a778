//! Server lifecycle coordination.
//!
//! Binds the listener and runs axum with graceful shutdown. On ctrl-c the
//! listener stops accepting, in-flight requests drain, and the background
//! reaper is cancelled before the process exits.

use anyhow::Context;
use anyhow::Result;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve the router until shutdown is requested.
///
/// `background` is cancelled once the listener has drained, so background
/// tasks never outlive the request surface.
pub async fn serve(addr: &str, app: Router, background: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "collaboration server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("listener drained, stopping background tasks");
    background.cancel();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown handler");
        return;
    }
    info!("shutdown signal received");
}
