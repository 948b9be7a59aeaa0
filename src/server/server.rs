use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::job_routes::job_routes;
use super::metrics::metrics_handler;
use super::state::{GuardedDaemon, ServerState};

pub fn make_app(daemon: GuardedDaemon) -> Router {
    let state = ServerState::new(daemon);

    Router::new()
        .nest("/api", job_routes(state))
        .route("/metrics", get(metrics_handler))
}

/// Serves the API until `shutdown` is cancelled.
pub async fn run_server(daemon: GuardedDaemon, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = make_app(daemon);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
