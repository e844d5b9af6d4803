//! Realtime wire protocol.
//!
//! Every message exchanged with the client or the remote model is a JSON
//! object carrying a `type` field. Messages are decoded once at the boundary
//! into an [`Event`], which pairs the classified [`EventKind`] with the full
//! JSON body and, when it came off a socket, the original wire text. Relaying
//! an event reuses that text, so forwarded payloads are byte-identical.

use std::fmt;

use serde_json::{json, Map, Value};

use crate::error::{RealtimeError, Result};
use crate::types::{PendingToolCall, SessionConfig};

pub const INPUT_AUDIO_APPEND: &str = "input_audio_buffer.append";
pub const SPEECH_STARTED: &str = "input_audio_buffer.speech_started";
pub const AUDIO_DELTA: &str = "response.audio.delta";
pub const FUNCTION_CALL_ARGUMENTS_DONE: &str = "response.function_call_arguments.done";
pub const AUDIO_TRANSCRIPT_DONE: &str = "response.audio_transcript.done";
pub const INPUT_TRANSCRIPTION_COMPLETED: &str =
    "conversation.item.input_audio_transcription.completed";
pub const ERROR: &str = "error";
pub const SESSION_UPDATE: &str = "session.update";
pub const RESPONSE_CREATE: &str = "response.create";
pub const CONVERSATION_ITEM_CREATE: &str = "conversation.item.create";

/// Model events that carry nothing the relay acts on.
pub const IGNORED_EVENT_TYPES: &[&str] = &[
    "response.function_call_arguments.delta",
    "rate_limits.updated",
    "response.audio_transcript.delta",
    "response.created",
    "response.content_part.added",
    "response.content_part.done",
    "conversation.item.created",
    "response.audio.done",
    "session.created",
    "session.updated",
    "response.done",
    "response.output_item.done",
];

/// Closed set of event kinds the relay distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    InputAudioAppend,
    SpeechStarted,
    AudioDelta,
    FunctionCallArgumentsDone,
    AssistantTranscriptDone,
    UserTranscriptCompleted,
    Error,
    SessionUpdate,
    ResponseCreate,
    ConversationItemCreate,
    /// On the fixed ignore list.
    Ignored,
    /// Anything else, kept by name for logging.
    Unknown(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            INPUT_AUDIO_APPEND => Self::InputAudioAppend,
            SPEECH_STARTED => Self::SpeechStarted,
            AUDIO_DELTA => Self::AudioDelta,
            FUNCTION_CALL_ARGUMENTS_DONE => Self::FunctionCallArgumentsDone,
            AUDIO_TRANSCRIPT_DONE => Self::AssistantTranscriptDone,
            INPUT_TRANSCRIPTION_COMPLETED => Self::UserTranscriptCompleted,
            ERROR => Self::Error,
            SESSION_UPDATE => Self::SessionUpdate,
            RESPONSE_CREATE => Self::ResponseCreate,
            CONVERSATION_ITEM_CREATE => Self::ConversationItemCreate,
            t if IGNORED_EVENT_TYPES.contains(&t) => Self::Ignored,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// One decoded protocol message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    body: Map<String, Value>,
    wire: Option<String>,
}

impl Event {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RealtimeError::Decode(format!("invalid JSON: {e}")))?;
        let mut event = Self::from_value(value)?;
        event.wire = Some(text.to_string());
        Ok(event)
    }

    /// Build an event from a JSON value. The value must be an object with a string `type`.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(body) = value else {
            return Err(RealtimeError::Decode("event is not a JSON object".into()));
        };
        let kind = match body.get("type") {
            Some(Value::String(t)) => EventKind::from_type(t),
            Some(_) => return Err(RealtimeError::Decode("event `type` is not a string".into())),
            None => return Err(RealtimeError::Decode("event has no `type` field".into())),
        };
        Ok(Self {
            kind,
            body,
            wire: None,
        })
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn event_type(&self) -> &str {
        self.body
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Base64 audio payload of an `input_audio_buffer.append` event.
    pub fn audio(&self) -> Option<&str> {
        match self.kind {
            EventKind::InputAudioAppend => self.get_str("audio"),
            _ => None,
        }
    }

    /// Transcript text of transcript-completion events.
    pub fn transcript(&self) -> Option<&str> {
        self.get_str("transcript")
    }

    /// Extract the tool call carried by `response.function_call_arguments.done`.
    pub fn tool_call(&self) -> Result<PendingToolCall> {
        if self.kind != EventKind::FunctionCallArgumentsDone {
            return Err(RealtimeError::Decode(format!(
                "`{}` does not carry a tool call",
                self.event_type()
            )));
        }
        let field = |key: &str| {
            self.get_str(key)
                .map(str::to_string)
                .ok_or_else(|| RealtimeError::Decode(format!("tool call is missing `{key}`")))
        };
        Ok(PendingToolCall {
            call_id: field("call_id")?,
            name: field("name")?,
            raw_arguments: field("arguments")?,
        })
    }

    /// Serialize for the wire. Events decoded from text are returned verbatim.
    pub fn to_wire(&self) -> String {
        match &self.wire {
            Some(text) => text.clone(),
            None => Value::Object(self.body.clone()).to_string(),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    /// Initial `session.update` announcing instructions, transcription,
    /// turn detection and the tool list.
    pub fn session_update(config: &SessionConfig) -> Self {
        let tools: Vec<Value> = config
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();

        Self::build(
            SESSION_UPDATE,
            json!({
                "session": {
                    "instructions": config.instructions,
                    "input_audio_transcription": config.transcription,
                    "turn_detection": config.turn_detection,
                    "tools": tools,
                },
            }),
        )
    }

    /// Ask the model to start a new response turn.
    pub fn response_create() -> Self {
        Self::build(RESPONSE_CREATE, json!({ "response": {} }))
    }

    /// Function call output addressed to `call_id`.
    pub fn tool_output(call_id: &str, output: impl Into<String>) -> Self {
        Self::build(
            CONVERSATION_ITEM_CREATE,
            json!({
                "item": {
                    "id": call_id,
                    "call_id": call_id,
                    "type": "function_call_output",
                    "output": output.into(),
                },
            }),
        )
    }

    /// Function call output reporting a failure for `call_id`.
    pub fn tool_error(call_id: &str, error: impl fmt::Display) -> Self {
        Self::tool_output(call_id, format!("Error: {error}"))
    }

    /// The `call_id` a tool output event is addressed to.
    pub fn output_call_id(&self) -> Option<&str> {
        self.body
            .get("item")
            .and_then(|item| item.get("call_id"))
            .and_then(Value::as_str)
    }

    /// The `output` text of a tool output event.
    pub fn output_text(&self) -> Option<&str> {
        self.body
            .get("item")
            .and_then(|item| item.get("output"))
            .and_then(Value::as_str)
    }

    fn build(event_type: &str, fields: Value) -> Self {
        let mut body = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert("type".into(), Value::String(event_type.into()));
        Self {
            kind: EventKind::from_type(event_type),
            body,
            wire: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TranscriptionConfig, TurnDetectionConfig};
    use crate::types::ToolDefinition;

    #[test]
    fn test_parse_classifies_known_types() {
        let cases = [
            (r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#, EventKind::InputAudioAppend),
            (r#"{"type":"response.audio.delta","delta":"AAAA"}"#, EventKind::AudioDelta),
            (r#"{"type":"input_audio_buffer.speech_started"}"#, EventKind::SpeechStarted),
            (r#"{"type":"error","error":{}}"#, EventKind::Error),
            (r#"{"type":"session.created"}"#, EventKind::Ignored),
            (r#"{"type":"response.done"}"#, EventKind::Ignored),
        ];
        for (text, kind) in cases {
            assert_eq!(Event::parse(text).unwrap().kind(), &kind, "{text}");
        }
    }

    #[test]
    fn test_unknown_type_is_kept_by_name() {
        let event = Event::parse(r#"{"type":"response.brand_new"}"#).unwrap();
        assert_eq!(event.kind(), &EventKind::Unknown("response.brand_new".into()));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for text in ["not json", "[1,2]", r#"{"no_type":1}"#, r#"{"type":5}"#] {
            assert!(
                matches!(Event::parse(text), Err(RealtimeError::Decode(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_wire_text_is_preserved() {
        // Key order and spacing differ from what serde_json would produce.
        let text = r#"{ "type": "response.audio.delta",  "z": 1, "delta": "UklGRg==" }"#;
        let event = Event::parse(text).unwrap();
        assert_eq!(event.to_wire(), text);
    }

    #[test]
    fn test_audio_only_on_append_events() {
        let append = Event::parse(r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#).unwrap();
        assert_eq!(append.audio(), Some("AAAA"));
        let delta = Event::parse(r#"{"type":"response.audio.delta","audio":"AAAA"}"#).unwrap();
        assert_eq!(delta.audio(), None);
    }

    #[test]
    fn test_tool_call_extraction() {
        let event = Event::parse(
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"web_search","arguments":"{\"query\":\"q\"}"}"#,
        )
        .unwrap();
        let call = event.tool_call().unwrap();
        assert_eq!(call.call_id, "c1");
        assert_eq!(call.name, "web_search");
        assert_eq!(call.raw_arguments, r#"{"query":"q"}"#);

        let missing = Event::parse(r#"{"type":"response.function_call_arguments.done","call_id":"c1"}"#)
            .unwrap();
        assert!(missing.tool_call().is_err());
    }

    #[test]
    fn test_tool_output_shape() {
        let event = Event::tool_output("c9", "42");
        assert_eq!(event.kind(), &EventKind::ConversationItemCreate);
        assert_eq!(event.output_call_id(), Some("c9"));
        assert_eq!(event.output_text(), Some("42"));
        let value = event.into_value();
        assert_eq!(value["item"]["id"], "c9");
        assert_eq!(value["item"]["type"], "function_call_output");

        let err = Event::tool_error("c9", "boom");
        assert_eq!(err.output_text(), Some("Error: boom"));
    }

    #[test]
    fn test_session_update_carries_everything() {
        let config = SessionConfig {
            model: "m".into(),
            instructions: Some("be brief".into()),
            tools: vec![ToolDefinition {
                name: "web_search".into(),
                description: "search the web".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            transcription: TranscriptionConfig {
                language: Some("tr".into()),
                ..Default::default()
            },
            turn_detection: TurnDetectionConfig::default(),
            sample_rate: 16000,
            tool_grace_ms: 0,
        };
        let value = Event::session_update(&config).into_value();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["instructions"], "be brief");
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "gpt-4o-transcribe");
        assert_eq!(value["session"]["input_audio_transcription"]["language"], "tr");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["silence_duration_ms"], 500);
        assert_eq!(value["session"]["tools"][0]["type"], "function");
        assert_eq!(value["session"]["tools"][0]["name"], "web_search");
    }

    #[test]
    fn test_response_create() {
        let event = Event::response_create();
        assert_eq!(event.kind(), &EventKind::ResponseCreate);
        let reparsed = Event::parse(&event.to_wire()).unwrap();
        assert_eq!(reparsed.event_type(), "response.create");
        assert_eq!(reparsed.get("response"), Some(&json!({})));
    }
}
