//! Trait surface of the external media engine.
//!
//! The engine is consumed as an opaque capability: create a router, create
//! transports on it, produce and consume streams, close handles. Each trait
//! maps to one engine object; the signaling layer holds them as
//! `Arc<dyn …>` and is the only owner responsible for closing them.
//!
//! Close operations are idempotent: closing an already-closed handle is a
//! no-op, never an error, so disconnect teardown stays total.

use crate::types::{
    IceCandidate, IceParameters, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportConnectOptions, TransportTuple, WebRtcTransportOptions,
};
use crate::types::{DtlsParameters, PlainTransportOptions};

use async_trait::async_trait;
use common::types::MediaKind;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Errors surfaced by engine capability calls.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine rejected or failed the operation.
    #[error("engine operation failed: {0}")]
    Operation(String),

    /// The handle (or its parent) has already been closed.
    #[error("engine handle closed")]
    Closed,

    /// `produce`/`consume` was asked to bridge media the router cannot.
    #[error("cannot consume: {0}")]
    CannotConsume(String),
}

/// Handle to one engine worker process.
///
/// Workers are created once at service start. A dead worker is fatal for
/// the host process: media-forwarding state cannot be recovered in place,
/// so the process observing `closed()` must exit rather than limp on.
#[async_trait]
pub trait EngineWorker: Send + Sync {
    /// Stable identity of the worker (process id or equivalent).
    fn id(&self) -> String;

    /// Token fired when the worker dies or is closed.
    fn closed(&self) -> CancellationToken;

    /// Create a router from the worker plus a codec capability list.
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError>;
}

/// Per-room rendezvous domain gating media exchange between producers and
/// consumers of compatible capability.
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> Uuid;

    /// The router's negotiated capability descriptor.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Create an interactive (ICE/DTLS) transport for one client.
    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    /// Create a non-interactive plain RTP transport (recording side).
    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    /// Whether a producer can be consumed with the given capabilities.
    ///
    /// This is the single correctness gate preventing the engine from
    /// being asked to bridge incompatible codecs.
    async fn can_consume(&self, producer_id: Uuid, rtp_capabilities: &RtpCapabilities) -> bool;
}

/// An engine-managed connection endpoint over which media is exchanged
/// with one client, or (in plain form) with the recording muxer.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> Uuid;

    /// ICE parameters; `None` for plain transports.
    fn ice_parameters(&self) -> Option<IceParameters>;

    /// ICE candidates; empty for plain transports.
    fn ice_candidates(&self) -> Vec<IceCandidate>;

    /// Local DTLS parameters; `None` for plain transports.
    fn dtls_parameters(&self) -> Option<DtlsParameters>;

    /// RTP socket tuple, once known.
    fn tuple(&self) -> Option<TransportTuple>;

    /// Separate RTCP socket tuple, for plain transports with
    /// `rtcp_mux: false`.
    fn rtcp_tuple(&self) -> Option<TransportTuple>;

    /// Complete the handshake (DTLS) or set the remote endpoint (plain).
    async fn connect(&self, options: TransportConnectOptions) -> Result<(), EngineError>;

    /// Publish a stream of `kind` into the router.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    /// Subscribe to an existing producer's stream.
    ///
    /// `paused` consumers deliver no media until resumed.
    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    /// Close the transport and everything created on it.
    async fn close(&self);
}

/// A published media stream of one kind from one client into a room.
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> Uuid;

    fn kind(&self) -> MediaKind;

    /// The producer's negotiated RTP parameters.
    fn rtp_parameters(&self) -> RtpParameters;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// A subscription to a producer's stream.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> Uuid;

    fn producer_id(&self) -> Uuid;

    fn kind(&self) -> MediaKind;

    /// The consumer's negotiated RTP parameters, needed by the client (or
    /// the recording SDP) to receive the stream.
    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    /// Un-pause delivery.
    async fn resume(&self) -> Result<(), EngineError>;

    /// Ask the producer side for a fresh key frame (video).
    async fn request_key_frame(&self) -> Result<(), EngineError>;

    async fn close(&self);
}
