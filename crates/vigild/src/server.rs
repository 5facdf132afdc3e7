//! Management HTTP server: reload and status.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use vigil_core::{Manager, StatusReport};

use crate::config::ServerConfig;

/// Serves the management API until the token is cancelled.
pub async fn run(
    config: ServerConfig,
    manager: Arc<Manager>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/reload", post(reload))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(manager);

    let listener = TcpListener::bind(&config.http_addr).await?;
    info!(addr = %listener.local_addr()?, "management server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

/// Reloads the services configuration. Errors surface with the failing
/// stage in the body; the previous configuration stays in effect.
async fn reload(State(manager): State<Arc<Manager>>) -> Result<&'static str, (StatusCode, String)> {
    manager
        .reload()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok("reloaded\n")
}

/// Full snapshot of services, reals and checkers.
async fn status(State(manager): State<Arc<Manager>>) -> Json<StatusReport> {
    Json(manager.status().await)
}
