//! WebSocket signaling surface.

/// Module for the WebSocket gateway and its routes
pub mod gateway;

/// Module for the wire protocol (envelopes, payloads, frames)
pub mod protocol;

pub use gateway::{router, GatewayState};
