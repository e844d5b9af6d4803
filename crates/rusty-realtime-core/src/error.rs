use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Malformed inbound event. Skipped, the stream continues.
    #[error("Protocol decode error: {0}")]
    Decode(String),

    #[error("tool {name} not found. Must be one of {available:?}")]
    ToolNotFound { name: String, available: Vec<String> },

    #[error("failed to parse arguments `{arguments}`: {reason}. Must be valid JSON.")]
    ToolArguments { arguments: String, reason: String },

    /// A second tool call arrived while another is still waiting for dispatch.
    #[error("Tool call {call_id} rejected: another call is already pending dispatch")]
    Conflict { call_id: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RealtimeError {
    /// Whether this error ends the session rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RealtimeError::Transport("reset".into()).is_fatal());
        assert!(!RealtimeError::Decode("bad".into()).is_fatal());
        assert!(!RealtimeError::Conflict { call_id: "c1".into() }.is_fatal());
        assert!(!RealtimeError::Cancelled.is_fatal());
    }

    #[test]
    fn test_tool_not_found_lists_available() {
        let err = RealtimeError::ToolNotFound {
            name: "nonexistent".into(),
            available: vec!["web_search".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("nonexistent"));
        assert!(msg.contains("web_search"));
    }
}
