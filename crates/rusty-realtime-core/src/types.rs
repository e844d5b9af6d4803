use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{TranscriptionConfig, TurnDetectionConfig};

/// A tool call requested by the model, waiting to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub call_id: String,
    pub name: String,
    /// Raw JSON argument text exactly as the model sent it.
    #[serde(rename = "arguments")]
    pub raw_arguments: String,
}

impl PendingToolCall {
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        raw_arguments: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }
}

/// Tool definition as advertised to the model in `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Origin tag attached to every item leaving the stream multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamLabel {
    InputMic,
    OutputSpeaker,
    ToolOutputs,
}

impl StreamLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputMic => "input_mic",
            Self::OutputSpeaker => "output_speaker",
            Self::ToolOutputs => "tool_outputs",
        }
    }
}

impl fmt::Display for StreamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one relay session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        next > self
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session left the Active state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnected,
    RemoteClosed,
    Shutdown,
    TransportFailed(String),
}

impl CloseReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::TransportFailed(_))
    }
}

/// Immutable per-session settings handed to the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub instructions: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub transcription: TranscriptionConfig,
    pub turn_detection: TurnDetectionConfig,
    /// Sample rate of client microphone audio, used by the VAD gate.
    pub sample_rate: u32,
    /// How long in-flight tool calls may keep running once the session closes.
    pub tool_grace_ms: u64,
}
