//! Per-session event loop.
//!
//! One [`SessionOrchestrator`] drives one client conversation. Client
//! microphone events, model events and tool results are merged by label and
//! handled one at a time:
//!
//! - `input_mic`: audio appends carrying an `audio` payload pass the voice
//!   activity gate before they are forwarded to the model; any other client
//!   event is forwarded unchanged.
//! - `output_speaker`: audio deltas and speech-started notifications go to the
//!   client, completed tool call arguments go to the tool coordinator,
//!   transcripts and errors are logged, everything else is dropped.
//! - `tool_outputs`: each result is sent to the model, followed by a
//!   `response.create` so the model continues the turn.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use rusty_realtime_core::config::RealtimeEndpoint;
use rusty_realtime_core::error::{RealtimeError, Result};
use rusty_realtime_core::protocol::{Event, EventKind};
use rusty_realtime_core::types::{CloseReason, SessionConfig, SessionState, StreamLabel};
use rusty_realtime_media::VoiceActivityGate;
use rusty_realtime_tools::{ToolCallCoordinator, ToolRegistry};

use crate::model::{EventStream, ModelSession};
use crate::mux::StreamMultiplexer;

/// Snapshot published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Set once the session starts closing.
    pub close_reason: Option<CloseReason>,
}

/// What a merged source produced.
enum Inbound {
    Event(Event),
    /// Undecodable item; skipped.
    Malformed(RealtimeError),
    /// Connection-level failure; ends the session.
    Failed(RealtimeError),
    /// The source ended.
    Ended,
}

pub struct SessionOrchestrator {
    config: SessionConfig,
    tools: Arc<ToolRegistry>,
    gate: Arc<VoiceActivityGate>,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig, tools: Arc<ToolRegistry>, gate: Arc<VoiceActivityGate>) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Connecting,
            close_reason: None,
        });
        Self {
            config,
            tools,
            gate,
            cancel: CancellationToken::new(),
            status,
        }
    }

    /// Use `token` for shutdown instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling this token closes the session with [`CloseReason::Shutdown`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Connect to the realtime endpoint and relay until the session closes.
    ///
    /// `input` yields client events as text; every event for the client is
    /// sent on `output` in order.
    pub async fn run<S>(
        self,
        endpoint: &RealtimeEndpoint,
        input: S,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<CloseReason>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => Err(RealtimeError::Cancelled),
            session = ModelSession::connect(endpoint) => session,
        };
        match connected {
            Ok(model) => Ok(self.run_with_session(model, input, output).await),
            Err(e) => {
                let reason = match &e {
                    RealtimeError::Cancelled => CloseReason::Shutdown,
                    other => CloseReason::TransportFailed(other.to_string()),
                };
                self.transition(SessionState::Closing, Some(reason));
                self.transition(SessionState::Closed, None);
                Err(e)
            }
        }
    }

    /// Relay over an already established model session.
    pub async fn run_with_session<S>(
        self,
        mut model: ModelSession,
        input: S,
        output: mpsc::UnboundedSender<String>,
    ) -> CloseReason
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let coordinator = ToolCallCoordinator::new(self.tools.clone());
        let mut mux = StreamMultiplexer::new();

        let reason = match self.open(&mut model).await {
            Err(reason) => reason,
            Ok(events) => {
                mux.insert(StreamLabel::InputMic, client_source(input));
                mux.insert(StreamLabel::OutputSpeaker, model_source(events));
                if let Some(results) = coordinator.results() {
                    mux.insert(StreamLabel::ToolOutputs, results.map(Inbound::Event));
                }
                self.transition(SessionState::Active, None);
                self.relay(&mut mux, &mut model, &coordinator, &output).await
            }
        };

        self.transition(SessionState::Closing, Some(reason.clone()));

        // Closing the mailbox lets the result stream end once in-flight calls finish.
        drop(coordinator);
        let tool_results = mux.remove(StreamLabel::ToolOutputs);
        drop(mux);

        if matches!(reason, CloseReason::ClientDisconnected | CloseReason::RemoteClosed) {
            if let Err(e) = model.close().await {
                debug!(%e, "Model connection close failed");
            }
        }
        self.drain_tools(tool_results).await;
        drop(model);

        self.transition(SessionState::Closed, None);
        reason
    }

    /// Send the session configuration and take the model event stream.
    async fn open(&self, model: &mut ModelSession) -> std::result::Result<EventStream, CloseReason> {
        let update = Event::session_update(&self.config);
        if let Err(e) = model.send(&update).await {
            error!(%e, "Failed to send session configuration");
            return Err(CloseReason::TransportFailed(e.to_string()));
        }
        info!(
            model = %self.config.model,
            tools = self.config.tools.len(),
            vad = self.gate.backend_name(),
            "Session configured"
        );
        model
            .receive()
            .ok_or_else(|| CloseReason::TransportFailed("model event stream already taken".into()))
    }

    async fn relay(
        &self,
        mux: &mut StreamMultiplexer<Inbound>,
        model: &mut ModelSession,
        coordinator: &ToolCallCoordinator,
        output: &mpsc::UnboundedSender<String>,
    ) -> CloseReason {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return CloseReason::Shutdown,
                next = mux.next() => next,
            };
            let Some((label, inbound)) = next else {
                return CloseReason::RemoteClosed;
            };

            let flow = match inbound {
                Inbound::Event(event) => match label {
                    StreamLabel::InputMic => self.on_client_event(event, model).await,
                    StreamLabel::OutputSpeaker => self.on_model_event(event, model, coordinator, output).await,
                    StreamLabel::ToolOutputs => self.on_tool_output(event, model).await,
                },
                Inbound::Malformed(e) => {
                    warn!(%label, %e, "Skipping malformed event");
                    ControlFlow::Continue(())
                }
                Inbound::Failed(e) => {
                    error!(%label, %e, "Model connection failed");
                    ControlFlow::Break(CloseReason::TransportFailed(e.to_string()))
                }
                Inbound::Ended => {
                    info!(%label, "Source ended");
                    ControlFlow::Break(match label {
                        StreamLabel::InputMic => CloseReason::ClientDisconnected,
                        _ => CloseReason::RemoteClosed,
                    })
                }
            };
            if let ControlFlow::Break(reason) = flow {
                return reason;
            }
        }
    }

    async fn on_client_event(&self, event: Event, model: &mut ModelSession) -> ControlFlow<CloseReason> {
        // Appends without an `audio` payload are forwarded ungated.
        if let Some(audio) = event.audio() {
            let pcm = match base64::engine::general_purpose::STANDARD.decode(audio) {
                Ok(pcm) => pcm,
                Err(e) => {
                    warn!(%e, "Undecodable audio payload, dropping");
                    return ControlFlow::Continue(());
                }
            };
            if !self.gate.is_speech(&pcm, self.config.sample_rate) {
                trace!(bytes = pcm.len(), "No speech, dropping audio");
                return ControlFlow::Continue(());
            }
        }
        send_to_model(model, &event).await
    }

    async fn on_model_event(
        &self,
        event: Event,
        model: &mut ModelSession,
        coordinator: &ToolCallCoordinator,
        output: &mpsc::UnboundedSender<String>,
    ) -> ControlFlow<CloseReason> {
        match event.kind() {
            EventKind::AudioDelta => return send_to_client(output, &event),
            EventKind::SpeechStarted => {
                debug!("User started speaking, interrupting playback");
                return send_to_client(output, &event);
            }
            EventKind::FunctionCallArgumentsDone => return self.submit_tool_call(&event, model, coordinator).await,
            EventKind::AssistantTranscriptDone => {
                info!(transcript = event.transcript().unwrap_or_default(), "Assistant");
            }
            EventKind::UserTranscriptCompleted => {
                info!(transcript = event.transcript().unwrap_or_default(), "User");
            }
            EventKind::Error => {
                let detail = event.get("error").map(|e| e.to_string()).unwrap_or_default();
                warn!(error = %detail, "Model reported an error");
            }
            EventKind::Ignored => trace!(event_type = event.event_type(), "Ignored event"),
            EventKind::Unknown(event_type) => info!(%event_type, "Unhandled event type"),
            other => debug!(kind = ?other, "Unexpected event from model"),
        }
        ControlFlow::Continue(())
    }

    async fn submit_tool_call(
        &self,
        event: &Event,
        model: &mut ModelSession,
        coordinator: &ToolCallCoordinator,
    ) -> ControlFlow<CloseReason> {
        let call = match event.tool_call() {
            Ok(call) => call,
            Err(e) => {
                warn!(%e, "Malformed tool call event");
                return ControlFlow::Continue(());
            }
        };
        info!(call_id = %call.call_id, tool = %call.name, "Tool call requested");
        match coordinator.submit(call) {
            Ok(()) => ControlFlow::Continue(()),
            // The pending call is kept; the model learns this one was refused.
            Err(RealtimeError::Conflict { call_id }) => {
                let refused = RealtimeError::Conflict {
                    call_id: call_id.clone(),
                };
                send_to_model(model, &Event::tool_error(&call_id, refused)).await
            }
            Err(e) => {
                warn!(%e, "Tool call not accepted");
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_tool_output(&self, event: Event, model: &mut ModelSession) -> ControlFlow<CloseReason> {
        debug!(call_id = event.output_call_id().unwrap_or_default(), "Returning tool output");
        send_to_model(model, &event).await?;
        send_to_model(model, &Event::response_create()).await
    }

    /// Give in-flight tool calls the grace period, discarding what they return.
    /// Dropping the stream afterwards aborts whatever is still running.
    async fn drain_tools(&self, results: Option<BoxStream<'static, Inbound>>) {
        let Some(mut results) = results else {
            return;
        };
        let grace_ms = self.config.tool_grace_ms;
        let drained = tokio::time::timeout(Duration::from_millis(grace_ms), async {
            while let Some(item) = results.next().await {
                if let Inbound::Event(event) = item {
                    info!(
                        call_id = event.output_call_id().unwrap_or_default(),
                        "Discarding tool output, session is closing"
                    );
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(grace_ms, "Abandoning tool calls still running after the grace period");
        }
    }

    fn transition(&self, next: SessionState, close_reason: Option<CloseReason>) {
        self.status.send_if_modified(|status| {
            if !status.state.can_transition_to(next) {
                return false;
            }
            info!(from = %status.state, to = %next, reason = ?close_reason, "Session state changed");
            status.state = next;
            if close_reason.is_some() {
                status.close_reason = close_reason;
            }
            true
        });
    }
}

fn client_source<S>(input: S) -> impl Stream<Item = Inbound> + Send + 'static
where
    S: Stream<Item = String> + Send + 'static,
{
    input
        .map(|text| match Event::parse(&text) {
            Ok(event) => Inbound::Event(event),
            Err(e) => Inbound::Malformed(e),
        })
        .chain(stream::once(async { Inbound::Ended }))
}

fn model_source(events: EventStream) -> impl Stream<Item = Inbound> + Send + 'static {
    events
        .map(|item| match item {
            Ok(event) => Inbound::Event(event),
            Err(e) if e.is_fatal() => Inbound::Failed(e),
            Err(e) => Inbound::Malformed(e),
        })
        .chain(stream::once(async { Inbound::Ended }))
}

async fn send_to_model(model: &mut ModelSession, event: &Event) -> ControlFlow<CloseReason> {
    match model.send(event).await {
        Ok(()) => ControlFlow::Continue(()),
        Err(e) => {
            error!(event_type = event.event_type(), %e, "Failed to send event to model");
            ControlFlow::Break(CloseReason::TransportFailed(e.to_string()))
        }
    }
}

fn send_to_client(output: &mpsc::UnboundedSender<String>, event: &Event) -> ControlFlow<CloseReason> {
    match output.send(event.to_wire()) {
        Ok(()) => ControlFlow::Continue(()),
        Err(_) => {
            info!("Client output closed");
            ControlFlow::Break(CloseReason::ClientDisconnected)
        }
    }
}
