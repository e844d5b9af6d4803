//! Realtime session engine.
//!
//! A session relays a live audio conversation between one client and the
//! remote realtime model. Three sources feed it: client microphone events,
//! model events, and tool results. The [`StreamMultiplexer`] merges them into
//! one stream that the [`SessionOrchestrator`] consumes in a single loop.

pub mod model;
pub mod mux;
pub mod orchestrator;

pub use model::{EventStream, ModelSession, ModelSink};
pub use mux::{merge, StreamMultiplexer};
pub use orchestrator::{SessionOrchestrator, SessionStatus};
