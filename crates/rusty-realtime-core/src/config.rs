//! Configuration loading and validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};
use crate::types::{SessionConfig, ToolDefinition};

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";
pub const DEFAULT_PROTOCOL_VERSION: &str = "realtime=v1";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_SEARCH_API_KEY_ENV: &str = "SERPER_API_KEY";

/// Placeholder in the instructions text replaced by `session.brand_name`.
pub const BRAND_PLACEHOLDER: &str = "{BRAND}";

/// Top-level Rusty Realtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad: Option<VadConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Remote realtime endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Value of the `OpenAI-Beta` header (e.g. "realtime=v1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

impl RealtimeConfig {
    /// Resolve the API key: `api_key` first, then `api_key_env` (default `OPENAI_API_KEY`).
    pub fn resolve_api_key(&self) -> Option<String> {
        let env = self
            .api_key_env
            .clone()
            .or_else(|| Some(DEFAULT_API_KEY_ENV.to_string()));
        resolve_secret_field(&self.api_key, &env)
    }
}

/// Fully resolved connection parameters for the remote endpoint.
#[derive(Clone)]
pub struct RealtimeEndpoint {
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub protocol_version: String,
}

impl fmt::Debug for RealtimeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeEndpoint")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Inline instructions text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Read instructions from a file instead (wins over `instructions`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions_file: Option<String>,

    /// Substituted for `{BRAND}` in the instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand_name: Option<String>,

    #[serde(default)]
    pub transcription: TranscriptionConfig,

    #[serde(default)]
    pub turn_detection: TurnDetectionConfig,

    #[serde(default = "default_tool_grace_ms")]
    pub tool_grace_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            instructions: None,
            instructions_file: None,
            brand_name: None,
            transcription: TranscriptionConfig::default(),
            turn_detection: TurnDetectionConfig::default(),
            tool_grace_ms: default_tool_grace_ms(),
        }
    }
}

fn default_tool_grace_ms() -> u64 {
    2000
}

/// Input audio transcription parameters sent in `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: default_transcription_model(),
            language: None,
            prompt: None,
        }
    }
}

fn default_transcription_model() -> String {
    "gpt-4o-transcribe".into()
}

/// Server-side turn detection thresholds sent in `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    #[serde(rename = "type", default = "default_turn_detection_type")]
    pub kind: String,

    #[serde(default = "default_vad_threshold")]
    pub threshold: f64,

    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_ms: u32,

    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u32,

    #[serde(default = "default_true")]
    pub create_response: bool,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            kind: default_turn_detection_type(),
            threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
            create_response: true,
        }
    }
}

fn default_turn_detection_type() -> String {
    "server_vad".into()
}

fn default_vad_threshold() -> f64 {
    0.6
}

fn default_prefix_padding_ms() -> u32 {
    300
}

fn default_silence_duration_ms() -> u32 {
    500
}

fn default_true() -> bool {
    true
}

/// Local voice-activity gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// "energy" (default) or "webrtc".
    #[serde(default = "default_vad_backend")]
    pub backend: String,

    /// 0 (least) to 3 (most aggressive).
    #[serde(default = "default_aggressiveness")]
    pub aggressiveness: u8,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            backend: default_vad_backend(),
            aggressiveness: default_aggressiveness(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_vad_backend() -> String {
    "energy".into()
}

fn default_aggressiveness() -> u8 {
    3
}

fn default_sample_rate() -> u32 {
    16000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_api_url: Option<String>,

    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_api_key: None,
            search_api_key_env: None,
            search_api_url: None,
            max_results: default_max_results(),
        }
    }
}

fn default_max_results() -> usize {
    5
}

impl ToolsConfig {
    pub fn resolve_search_api_key(&self) -> Option<String> {
        let env = self
            .search_api_key_env
            .clone()
            .or_else(|| Some(DEFAULT_SEARCH_API_KEY_ENV.to_string()));
        resolve_secret_field(&self.search_api_key, &env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "rusty_realtime_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_REF: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env reference pattern"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| RealtimeError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn vad(&self) -> VadConfig {
        self.vad.clone().unwrap_or_default()
    }

    pub fn tools(&self) -> ToolsConfig {
        self.tools.clone().unwrap_or_default()
    }

    pub fn realtime_model(&self) -> String {
        self.realtime
            .as_ref()
            .and_then(|r| r.model.clone())
            .unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string())
    }

    /// Resolve the remote endpoint. Fails when no API key can be found.
    pub fn realtime_endpoint(&self) -> Result<RealtimeEndpoint> {
        let realtime = self.realtime.clone().unwrap_or_default();
        let api_key = realtime.resolve_api_key().ok_or_else(|| {
            RealtimeError::Config(format!(
                "No realtime API key configured (set realtime.api_key or {})",
                realtime.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV)
            ))
        })?;

        Ok(RealtimeEndpoint {
            url: realtime
                .url
                .unwrap_or_else(|| DEFAULT_REALTIME_URL.to_string()),
            model: self.realtime_model(),
            api_key,
            protocol_version: realtime
                .protocol_version
                .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string()),
        })
    }

    /// Resolve the instructions text, reading `instructions_file` if set and
    /// substituting the brand name.
    pub fn instructions(&self) -> Result<Option<String>> {
        let Some(session) = &self.session else {
            return Ok(None);
        };

        let text = match &session.instructions_file {
            Some(file) => Some(std::fs::read_to_string(file)?),
            None => session.instructions.clone(),
        };

        Ok(text.map(|t| match &session.brand_name {
            Some(brand) => t.replace(BRAND_PLACEHOLDER, brand),
            None => t,
        }))
    }

    /// Build the immutable per-session config handed to the orchestrator.
    pub fn session_config(&self, tools: Vec<ToolDefinition>) -> Result<SessionConfig> {
        let settings = self.session.clone().unwrap_or_default();
        Ok(SessionConfig {
            model: self.realtime_model(),
            instructions: self.instructions()?,
            tools,
            transcription: settings.transcription,
            turn_detection: settings.turn_detection,
            sample_rate: self.vad().sample_rate,
            tool_grace_ms: settings.tool_grace_ms,
        })
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self
            .realtime
            .clone()
            .unwrap_or_default()
            .resolve_api_key()
            .is_none()
        {
            warnings.push("Realtime endpoint has no API key configured".to_string());
        }

        if self.tools().resolve_search_api_key().is_none() {
            warnings.push("No search API key configured, web_search is disabled".to_string());
        }

        let vad = self.vad();
        if vad.aggressiveness > 3 {
            errors.push(format!(
                "VAD aggressiveness must be 0-3, got {}",
                vad.aggressiveness
            ));
        }
        if !matches!(vad.sample_rate, 8000 | 16000 | 32000 | 48000) {
            errors.push(format!(
                "VAD sample rate must be 8000, 16000, 32000, or 48000 Hz, got {}",
                vad.sample_rate
            ));
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Copy with inline secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Some(realtime) = config.realtime.as_mut() {
            if realtime.api_key.is_some() {
                realtime.api_key = Some("***".into());
            }
        }
        if let Some(tools) = config.tools.as_mut() {
            if tools.search_api_key.is_some() {
                tools.search_api_key = Some("***".into());
            }
        }
        config
    }
}

/// Base directory for Rusty Realtime data: `~/.rusty_realtime/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rusty_realtime")
}
