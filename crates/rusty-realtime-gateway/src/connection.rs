//! One client WebSocket, relayed through one session orchestrator.

use std::future::ready;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rusty_realtime_session::SessionOrchestrator;

use crate::state::{GatewayState, SessionEntry};

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let session_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, "New client connection");

    let (mut ws_tx, ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let orchestrator = SessionOrchestrator::new(
        state.session_config.clone(),
        state.tools.clone(),
        state.gate.clone(),
    )
    .with_cancellation(state.shutdown.child_token());

    state.sessions.write().await.insert(
        session_id.clone(),
        SessionEntry {
            session_id: session_id.clone(),
            started_at: Instant::now(),
            status: orchestrator.subscribe(),
        },
    );

    // Orchestrator output goes back to the client in order.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Client text frames until the client closes or the socket fails.
    let log_id = session_id.clone();
    let input = ws_rx
        .take_while(move |msg| {
            let open = match msg {
                Ok(Message::Close(_)) => {
                    debug!(session_id = %log_id, "Client requested close");
                    false
                }
                Err(e) => {
                    warn!(session_id = %log_id, %e, "Client socket error");
                    false
                }
                Ok(_) => true,
            };
            ready(open)
        })
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Text(text)) => Some(text.to_string()),
                _ => None,
            })
        });

    match orchestrator.run(&state.endpoint, input, out_tx).await {
        Ok(reason) if reason.is_failure() => warn!(session_id = %session_id, ?reason, "Session failed"),
        Ok(reason) => info!(session_id = %session_id, ?reason, "Session ended"),
        Err(e) => error!(session_id = %session_id, %e, "Could not start session"),
    }

    // The sender drains once the orchestrator drops its output handle.
    if let Err(e) = send_task.await {
        debug!(%e, "Client writer ended abnormally");
    }
    cleanup_session(&state, &session_id).await;
    info!(session_id = %session_id, "Client connection closed");
}

async fn cleanup_session(state: &GatewayState, session_id: &str) {
    if let Some(entry) = state.sessions.write().await.remove(session_id) {
        debug!(
            session_id = %entry.session_id,
            state = %entry.status.borrow().state,
            duration_ms = entry.started_at.elapsed().as_millis() as u64,
            "Session removed"
        );
    }
}
