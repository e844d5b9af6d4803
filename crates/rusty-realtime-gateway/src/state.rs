//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use rusty_realtime_core::config::RealtimeEndpoint;
use rusty_realtime_core::types::SessionConfig;
use rusty_realtime_media::VoiceActivityGate;
use rusty_realtime_session::SessionStatus;
use rusty_realtime_tools::ToolRegistry;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub endpoint: RealtimeEndpoint,
    pub session_config: SessionConfig,
    pub tools: Arc<ToolRegistry>,
    pub gate: Arc<VoiceActivityGate>,
    pub sessions: RwLock<HashMap<String, SessionEntry>>,
    /// Parent of every session's cancellation token.
    pub shutdown: CancellationToken,
}

/// A live relay session.
pub struct SessionEntry {
    pub session_id: String,
    pub started_at: Instant,
    pub status: watch::Receiver<SessionStatus>,
}

impl GatewayState {
    pub fn new(
        endpoint: RealtimeEndpoint,
        session_config: SessionConfig,
        tools: Arc<ToolRegistry>,
        gate: Arc<VoiceActivityGate>,
    ) -> Self {
        Self {
            endpoint,
            session_config,
            tools,
            gate,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
