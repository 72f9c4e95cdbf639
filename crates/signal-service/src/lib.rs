//! Parley signaling service library.
//!
//! Session-state and signaling-protocol layer for multi-party WebRTC
//! conferencing: room/client/transport/producer/consumer registries, the
//! ordered signaling protocol that drives them, occupancy broadcasting,
//! and the recording pipeline that republishes a room's streams to an
//! external muxer.

#![warn(clippy::pedantic)]

/// Module for the actor system (supervisor + per-room actors)
pub mod actors;

/// Module for configuration
pub mod config;

/// Module for error types
pub mod errors;

/// Module for health endpoints
pub mod observability;

/// Module for the recording pipeline
pub mod recording;

/// Module for the WebSocket signaling gateway and wire protocol
pub mod signaling;

/// Module for the room-metadata store and its REST endpoints
pub mod store;
