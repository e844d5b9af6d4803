//! Media pipeline for the realtime relay: voice activity gating of
//! microphone audio before it is forwarded to the model.

pub mod vad;

pub use vad::{EnergyVad, VadBackend, VoiceActivityGate};
#[cfg(feature = "webrtc")]
pub use vad::WebRtcVad;
