//! Axum-based WebSocket server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Routes served by the gateway.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway on `bind:port` and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>, bind: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Shutdown cancels every live session, then waits for open connections to
/// finish closing.
pub async fn serve<F>(listener: TcpListener, state: Arc<GatewayState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = state.shutdown.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            token.cancel();
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let sessions = state.session_count().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": sessions,
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to listen for Ctrl-C, shutting down");
    }
    info!("Shutdown signal received");
}
