//! WebSocket gateway for the realtime relay.
//!
//! Every client socket on `/ws` gets its own session orchestrator connected to
//! the realtime model. `/health` reports how many sessions are live.

mod connection;
pub mod server;
pub mod state;

pub use server::{router, serve, start_gateway};
pub use state::{GatewayState, SessionEntry};
