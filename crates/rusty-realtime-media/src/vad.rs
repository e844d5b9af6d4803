//! Voice activity gate for microphone audio.
//!
//! The gate classifies one fixed 20 ms window of 16-bit little-endian PCM.
//! Only the first window of a buffer is inspected: a buffer longer than one
//! frame is judged by its leading 20 ms, and a buffer shorter than one frame
//! is never speech. This keeps the decision single-frame and latency bounded,
//! at the cost of missing speech that starts later in an oversized buffer.

use tracing::debug;

use rusty_realtime_core::config::VadConfig;
use rusty_realtime_core::error::{RealtimeError, Result};

/// Analysis window length in milliseconds.
pub const FRAME_MS: usize = 20;

/// Bytes per 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

/// A voice/non-voice classifier for a single PCM frame.
pub trait VadBackend: Send + Sync {
    /// Classify one frame of samples recorded at `sample_rate`.
    fn is_voice(&self, frame: &[i16], sample_rate: u32) -> bool;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// RMS energy threshold detector on 16-bit PCM.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f64,
}

impl EnergyVad {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Threshold from an aggressiveness level 0-3 (higher rejects more).
    pub fn with_aggressiveness(level: u8) -> Self {
        let threshold = match level {
            0 => 100.0,
            1 => 200.0,
            2 => 300.0,
            _ => 500.0,
        };
        Self::new(threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compute RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }
}

impl VadBackend for EnergyVad {
    fn is_voice(&self, frame: &[i16], _sample_rate: u32) -> bool {
        Self::rms(frame) > self.threshold
    }

    fn name(&self) -> &str {
        "energy"
    }
}

/// WebRTC VAD at a fixed mode.
///
/// `webrtc_vad::Vad` is neither `Send` nor `Sync`, so a detector is built per
/// frame. Each frame is classified independently anyway.
#[cfg(feature = "webrtc")]
#[derive(Debug, Clone)]
pub struct WebRtcVad {
    aggressiveness: u8,
}

#[cfg(feature = "webrtc")]
impl WebRtcVad {
    pub fn new(aggressiveness: u8) -> Self {
        Self {
            aggressiveness: aggressiveness.min(3),
        }
    }
}

#[cfg(feature = "webrtc")]
impl VadBackend for WebRtcVad {
    fn is_voice(&self, frame: &[i16], sample_rate: u32) -> bool {
        use webrtc_vad::{SampleRate, Vad, VadMode};

        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                tracing::warn!(sample_rate = other, "Unsupported sample rate for WebRTC VAD");
                return false;
            }
        };
        let mode = match self.aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);
        match vad.is_voice_segment(frame) {
            Ok(voice) => voice,
            Err(()) => {
                tracing::warn!(samples = frame.len(), "WebRTC VAD rejected frame");
                false
            }
        }
    }

    fn name(&self) -> &str {
        "webrtc"
    }
}

/// Decides whether a microphone buffer contains speech.
pub struct VoiceActivityGate {
    backend: Box<dyn VadBackend>,
}

impl VoiceActivityGate {
    pub fn new(backend: Box<dyn VadBackend>) -> Self {
        Self { backend }
    }

    /// Build the gate described by the `vad` config section.
    pub fn from_config(config: &VadConfig) -> Result<Self> {
        let backend: Box<dyn VadBackend> = match config.backend.as_str() {
            "energy" => Box::new(EnergyVad::with_aggressiveness(config.aggressiveness)),
            #[cfg(feature = "webrtc")]
            "webrtc" => Box::new(WebRtcVad::new(config.aggressiveness)),
            other => {
                return Err(RealtimeError::Config(format!(
                    "Unknown or disabled VAD backend: {other}"
                )));
            }
        };
        debug!(backend = backend.name(), aggressiveness = config.aggressiveness, "VAD gate ready");
        Ok(Self::new(backend))
    }

    /// Size in bytes of one analysis window at `sample_rate`.
    pub fn frame_bytes(sample_rate: u32) -> usize {
        sample_rate as usize * FRAME_MS / 1000 * BYTES_PER_SAMPLE
    }

    /// Classify the first 20 ms of `buffer`. Short buffers are never speech.
    pub fn is_speech(&self, buffer: &[u8], sample_rate: u32) -> bool {
        let frame_bytes = Self::frame_bytes(sample_rate);
        if frame_bytes == 0 || buffer.len() < frame_bytes {
            return false;
        }

        let samples: Vec<i16> = buffer[..frame_bytes]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();

        self.backend.is_voice(&samples, sample_rate)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

impl Default for VoiceActivityGate {
    fn default() -> Self {
        Self::new(Box::new(EnergyVad::with_aggressiveness(3)))
    }
}
