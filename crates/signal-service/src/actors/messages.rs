//! Message and reply types for the actor system.
//!
//! Reply structs serialize in the exact wire shape the signaling gateway
//! returns to clients, so handlers embed them without re-mapping.

use crate::errors::SignalError;

use common::types::{ClientId, MediaKind, RoomId, TransportDirection};
use media_engine::types::{
    DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Server-initiated event pushed to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerEvent {
    /// Room occupancy changed.
    CountUpdate { count: usize },
    /// An unhandled failure was converted to a client-safe message.
    Exception { message: String },
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::CountUpdate { .. } => "count-update",
            ServerEvent::Exception { .. } => "exception",
        }
    }
}

/// Reply to `join`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub socket_id: ClientId,
    pub room_id: RoomId,
    /// Occupancy by the displayed-count convention (members minus the
    /// requesting client).
    pub count: usize,
}

/// Reply to `createWebRtcTransport`: the connection parameters the client
/// needs to establish the transport.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: Uuid,
    pub ice_parameters: Option<IceParameters>,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: Option<DtlsParameters>,
}

/// Reply to `transport-produce`.
#[derive(Debug, Clone, Serialize)]
pub struct ProduceReply {
    pub id: Uuid,
}

/// Consumer parameters returned by a successful `consume`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Outcome of `consume`.
///
/// Capability incompatibility is a structured payload, not an error: the
/// operation aborts but the session stays usable.
#[derive(Debug, Clone)]
pub enum ConsumeReply {
    Ready(ConsumerParams),
    Incompatible { error: String },
}

/// Messages handled by the room supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Get (creating lazily) the actor for `room_id`.
    RoomHandle {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<crate::actors::room::RoomActorHandle, SignalError>>,
    },
    /// Current supervisor status.
    GetStatus {
        respond_to: oneshot::Sender<SupervisorStatus>,
    },
}

/// Supervisor status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub room_count: usize,
}

/// Messages handled by a room actor.
pub enum RoomMessage {
    /// A client joins the room. Creates the router on first join.
    Join {
        client_id: ClientId,
        events: mpsc::Sender<ServerEvent>,
        respond_to: oneshot::Sender<Result<JoinReply, SignalError>>,
    },

    /// The room router's capability descriptor.
    RtpCapabilities {
        client_id: ClientId,
        respond_to: oneshot::Sender<Result<RtpCapabilities, SignalError>>,
    },

    /// Create a send or receive transport for a client.
    CreateTransport {
        client_id: ClientId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportParams, SignalError>>,
    },

    /// Forward DTLS handshake parameters to a client's transport.
    ConnectTransport {
        client_id: ClientId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Publish a stream on the client's send transport.
    Produce {
        client_id: ClientId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProduceReply, SignalError>>,
    },

    /// Subscribe to the room's producer of `kind`.
    Consume {
        client_id: ClientId,
        kind: MediaKind,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumeReply, SignalError>>,
    },

    /// Un-pause the client's consumer of `kind`.
    ResumeConsumer {
        client_id: ClientId,
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Start recording the room's audio and video producers.
    StartRecording {
        client_id: ClientId,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Stop an active recording and release its resources.
    StopRecording {
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Disconnect reconciliation: release everything the client owns.
    /// Total and idempotent; the reply is informational only.
    Disconnect {
        client_id: ClientId,
        respond_to: oneshot::Sender<()>,
    },

    /// Current occupancy by the displayed-count convention.
    OccupantCount {
        respond_to: oneshot::Sender<usize>,
    },

    /// The recording muxer exited (internal, sent by the monitor task).
    /// `record_name` identifies the recording the muxer belonged to, so
    /// a trailing exit from a stopped recording cannot touch a newer one.
    MuxerExited {
        record_name: String,
        unexpected: bool,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_join_reply_wire_shape() {
        let reply = JoinReply {
            socket_id: ClientId::new(),
            room_id: RoomId::from("r1"),
            count: 2,
        };

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["roomId"], "r1");
        assert_eq!(json["count"], 2);
        assert!(json.get("socketId").is_some());
    }

    #[test]
    fn test_supervisor_message_is_debug() {
        // Every payload carried by the supervisor mailbox, the room
        // handle included, must keep formatting for trace logs.
        let (tx, _rx) = oneshot::channel();
        let message = SupervisorMessage::RoomHandle {
            room_id: RoomId::from("r1"),
            respond_to: tx,
        };
        assert!(format!("{message:?}").contains("RoomHandle"));
    }

    #[test]
    fn test_server_event_names() {
        assert_eq!(ServerEvent::CountUpdate { count: 0 }.name(), "count-update");
        assert_eq!(
            ServerEvent::Exception {
                message: "x".to_string()
            }
            .name(),
            "exception"
        );
    }
}
