//! Liveness endpoints

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use chrono::{SecondsFormat, Utc};
use tracing::info;

/// Build the health router
pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/probe/now", get(current_time))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Current UTC time; a stuck runtime stops answering
async fn current_time() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Serve the health router until the process exits
pub async fn serve_health(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");
    axum::serve(listener, health_router()).await
}
