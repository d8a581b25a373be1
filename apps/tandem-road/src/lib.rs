//! tandem-road: websocket signaling relay.
//!
//! Endpoints connect on `/ws`, introduce themselves, and get a relay-assigned
//! id. Descriptions and candidates are routed one-to-one with the recipient's
//! politeness role stamped in; connects and disconnects are broadcast.

pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::router::MessageRouter;

pub struct AppState {
    pub router: MessageRouter,
    pub config: RelayConfig,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Arc<Self> {
        Arc::new(Self {
            router: MessageRouter::new(),
            config,
            metrics,
        })
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/endpoints", get(handlers::list_endpoints))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let monitor = websocket::spawn_heartbeat_monitor(
        state.router.clone(),
        state.config.heartbeat_timeout,
        state.config.heartbeat_sweep,
    );
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(addr = %local_addr, "tandem-road listening");

    let result = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error");
    monitor.abort();
    result
}
