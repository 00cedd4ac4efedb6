//! Agent health endpoint.
//!
//! Serves `GET /healthz` so supervisors can see whether the agent holds a
//! live controller session.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::agent::state::LifecycleManager;
use crate::connection::websocket::wait_for_shutdown;

/// Health handler.
///
/// 200 while a controller session is running, 503 otherwise. The body is the
/// lifecycle snapshot either way.
pub async fn healthz(State(lifecycle): State<LifecycleManager>) -> impl IntoResponse {
    let status = if lifecycle.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(lifecycle.snapshot()))
}

pub fn router(lifecycle: LifecycleManager) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(lifecycle)
}

/// Serve the health endpoint until the shutdown flag is set
pub async fn serve_health(
    listener: TcpListener,
    lifecycle: LifecycleManager,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr().context("health listener has no address")?;
    info!(%addr, "Serving agent health endpoint");

    axum::serve(listener, router(lifecycle))
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await
        .context("health endpoint failed")?;

    info!("Health endpoint stopped");
    Ok(())
}

/// Parse a bind address; a bare `:port` binds all interfaces
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid healthcheck address: {addr}"))
}
