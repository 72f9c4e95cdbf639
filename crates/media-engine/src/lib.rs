//! Media engine capability surface.
//!
//! The signaling layer never touches packets. Everything that moves media
//! (ICE/DTLS/SRTP, RTP forwarding, codec handling) lives behind the trait
//! surface in [`engine`]: a worker creates routers, routers create
//! transports, transports produce and consume streams. Handles are
//! `Arc<dyn …>` so the signaling layer can hold and close them without
//! knowing which engine backend is running.
//!
//! [`loopback`] provides an in-process engine implementing the surface for
//! development and tests.

#![warn(clippy::pedantic)]

/// Module for the engine trait surface
pub mod engine;

/// Module for the in-process loopback engine
pub mod loopback;

/// Module for RTP/ICE/DTLS parameter types
pub mod types;

pub use engine::{Consumer, EngineError, EngineWorker, Producer, Router, Transport};
