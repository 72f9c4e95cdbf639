//! WebSocket signaling gateway.
//!
//! One socket is one client: a fresh `ClientId` is minted at upgrade time
//! and identifies everything the connection owns. The socket's ordered
//! framing gives per-client operation ordering; cross-client ordering is
//! the room actor's job. Socket close always runs disconnect
//! reconciliation.

use crate::actors::messages::{ConsumeReply, ServerEvent};
use crate::actors::room::RoomActorHandle;
use crate::actors::supervisor::RoomSupervisorHandle;
use crate::errors::SignalError;
use crate::signaling::protocol::{
    self, ConnectTransportRequest, ConsumeRequest, CreateTransportRequest, Envelope, JoinRequest,
    ProduceRequest, ResumeConsumerRequest,
};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common::types::{ClientId, MediaKind, RoomId, TransportDirection};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Conferencing-mode namespaces the gateway accepts.
const NAMESPACE: &str = "mediasoup";

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Shared state of the signaling routes.
#[derive(Clone)]
pub struct GatewayState {
    pub supervisor: RoomSupervisorHandle,
}

/// Signaling routes (`GET /signal/:namespace`).
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/signal/:namespace", get(upgrade_handler))
        .with_state(state)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Path(namespace): Path<String>,
    State(state): State<GatewayState>,
) -> Response {
    if namespace != NAMESPACE {
        return (StatusCode::NOT_FOUND, "unknown namespace").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let client_id = ClientId::new();
    info!(target: "gateway", client_id = %client_id, "client connected");

    let (mut sink, mut stream) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(EVENT_CHANNEL_CAPACITY);

    let mut connection = Connection {
        client_id,
        supervisor: state.supervisor,
        room: None,
    };

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Some(frame) = connection.handle_text(&text, &event_tx).await else {
                        continue;
                    };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(target: "gateway", client_id = %client_id, error = %e, "socket error");
                    break;
                }
            },
            event = event_rx.recv() => match event {
                Some(event) => {
                    if sink.send(Message::Text(protocol::event_frame(&event))).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Reconciliation runs on every exit path, clean close or not.
    if let Some(room) = connection.room.take() {
        room.disconnect(client_id).await;
    }
    info!(target: "gateway", client_id = %client_id, "client disconnected");
}

/// Per-socket signaling state.
struct Connection {
    client_id: ClientId,
    supervisor: RoomSupervisorHandle,
    /// Set by `join`; all later operations go through it.
    room: Option<RoomActorHandle>,
}

impl Connection {
    /// Process one text frame; returns the reply frame, if any.
    async fn handle_text(
        &mut self,
        text: &str,
        events: &mpsc::Sender<ServerEvent>,
    ) -> Option<String> {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "gateway", client_id = %self.client_id, error = %e, "dropping malformed frame");
                return Some(protocol::event_frame(&ServerEvent::Exception {
                    message: e.client_message(),
                }));
            }
        };

        match self.dispatch(&envelope, events).await {
            Ok(data) => Some(protocol::reply_frame(envelope.seq, data)),
            Err(e) => {
                warn!(
                    target: "gateway",
                    client_id = %self.client_id,
                    action = %envelope.action,
                    error = %e,
                    "signaling operation failed"
                );
                Some(protocol::error_frame(envelope.seq, &e))
            }
        }
    }

    async fn dispatch(
        &mut self,
        envelope: &Envelope,
        events: &mpsc::Sender<ServerEvent>,
    ) -> Result<Value, SignalError> {
        match envelope.action.as_str() {
            "join" => {
                let request: JoinRequest = envelope.payload()?;
                let room = self
                    .supervisor
                    .room_handle(RoomId::new(request.room_id))
                    .await?;
                // Joining moves the client; its membership in a previous
                // room must not outlive the socket's association with it.
                if let Some(previous) = self.room.take() {
                    if previous.room_id() != room.room_id() {
                        previous.disconnect(self.client_id).await;
                    }
                }
                let reply = room.join(self.client_id, events.clone()).await?;
                self.room = Some(room);
                to_value(&reply)
            }
            "getRtpCapabilities" => {
                let room = self.room()?;
                let capabilities = room.router_rtp_capabilities(self.client_id).await?;
                Ok(json!({ "rtpCapabilities": capabilities }))
            }
            "createWebRtcTransport" => {
                let request: CreateTransportRequest = envelope.payload()?;
                let direction = if request.sender {
                    TransportDirection::Send
                } else {
                    TransportDirection::Recv
                };
                let room = self.room()?;
                let params = room.create_transport(self.client_id, direction).await?;
                Ok(json!({ "params": params }))
            }
            "transport-connect" => {
                let request: ConnectTransportRequest = envelope.payload()?;
                let room = self.room()?;
                room.connect_transport(
                    self.client_id,
                    TransportDirection::Send,
                    request.dtls_parameters,
                )
                .await?;
                Ok(json!({}))
            }
            "transport-recv-connect" => {
                let request: ConnectTransportRequest = envelope.payload()?;
                let room = self.room()?;
                room.connect_transport(
                    self.client_id,
                    TransportDirection::Recv,
                    request.dtls_parameters,
                )
                .await?;
                Ok(json!({}))
            }
            "transport-produce" => {
                let request: ProduceRequest = envelope.payload()?;
                let kind = parse_kind(&request.kind)?;
                let room = self.room()?;
                let reply = room
                    .produce(self.client_id, kind, request.rtp_parameters)
                    .await?;
                to_value(&reply)
            }
            "consume" => {
                let request: ConsumeRequest = envelope.payload()?;
                let kind = parse_kind(&request.kind)?;
                let room = self.room()?;
                match room
                    .consume(self.client_id, kind, request.rtp_capabilities)
                    .await?
                {
                    ConsumeReply::Ready(params) => Ok(json!({ "params": params })),
                    ConsumeReply::Incompatible { error } => {
                        Ok(json!({ "params": { "error": error } }))
                    }
                }
            }
            "consumer-resume" => {
                let request: ResumeConsumerRequest = envelope.payload()?;
                let kind = parse_kind(&request.kind)?;
                let room = self.room()?;
                room.resume_consumer(self.client_id, kind).await?;
                Ok(json!({}))
            }
            "recording-start" => {
                // Fire-and-forget for the client: failures surface as an
                // exception event, not an error reply.
                let room = self.room()?;
                if let Err(e) = room.start_recording(self.client_id).await {
                    warn!(
                        target: "gateway",
                        client_id = %self.client_id,
                        error = %e,
                        "recording start failed"
                    );
                    let _ = events
                        .send(ServerEvent::Exception {
                            message: e.client_message(),
                        })
                        .await;
                }
                Ok(json!({}))
            }
            "recording-stop" => {
                let room = self.room()?;
                room.stop_recording().await?;
                Ok(json!({}))
            }
            other => Err(SignalError::InvalidState(format!(
                "unknown action: {other}"
            ))),
        }
    }

    fn room(&self) -> Result<RoomActorHandle, SignalError> {
        self.room
            .clone()
            .ok_or_else(|| SignalError::InvalidState("join a room first".to_string()))
    }
}

fn parse_kind(raw: &str) -> Result<MediaKind, SignalError> {
    match raw {
        "audio" => Ok(MediaKind::Audio),
        "video" => Ok(MediaKind::Video),
        other => Err(SignalError::KindNotSupported(other.to_string())),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, SignalError> {
    serde_json::to_value(value)
        .map_err(|e| SignalError::Internal(format!("reply serialization failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use media_engine::loopback::{LoopbackWorker, WorkerSettings};
    use media_engine::EngineWorker;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn connection() -> (Connection, Arc<LoopbackWorker>) {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let supervisor = RoomSupervisorHandle::new(
            Arc::clone(&worker) as Arc<dyn EngineWorker>,
            Arc::new(Config::from_vars(&HashMap::new()).unwrap()),
            CancellationToken::new(),
        );
        (
            Connection {
                client_id: ClientId::new(),
                supervisor,
                room: None,
            },
            worker,
        )
    }

    async fn request(connection: &mut Connection, seq: u64, frame: &str) -> Value {
        let (tx, _rx) = mpsc::channel(8);
        let reply = connection.handle_text(frame, &tx).await.unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["seq"], seq);
        value["data"].clone()
    }

    #[tokio::test]
    async fn test_join_then_capabilities_flow() {
        let (mut connection, worker) = connection();

        let data = request(
            &mut connection,
            1,
            r#"{"seq": 1, "action": "join", "data": {"roomId": "r1"}}"#,
        )
        .await;
        assert_eq!(data["roomId"], "r1");
        assert_eq!(data["count"], 0);

        let data = request(
            &mut connection,
            2,
            r#"{"seq": 2, "action": "getRtpCapabilities"}"#,
        )
        .await;
        assert!(data["rtpCapabilities"]["codecs"].is_array());

        worker.close();
    }

    #[tokio::test]
    async fn test_operations_before_join_return_error_payload() {
        let (mut connection, worker) = connection();

        let data = request(
            &mut connection,
            5,
            r#"{"seq": 5, "action": "getRtpCapabilities"}"#,
        )
        .await;
        assert_eq!(data["error"], "join a room first");

        worker.close();
    }

    #[tokio::test]
    async fn test_rejoining_another_room_leaves_the_first() {
        let (mut connection, worker) = connection();

        request(
            &mut connection,
            1,
            r#"{"seq": 1, "action": "join", "data": {"roomId": "r1"}}"#,
        )
        .await;

        // A second member makes r1's occupancy observable.
        let r1 = connection
            .supervisor
            .room_handle(RoomId::from("r1"))
            .await
            .unwrap();
        let other = ClientId::new();
        let (other_tx, _other_rx) = mpsc::channel(8);
        r1.join(other, other_tx).await.unwrap();
        assert_eq!(r1.occupant_count().await.unwrap(), 1);

        let data = request(
            &mut connection,
            2,
            r#"{"seq": 2, "action": "join", "data": {"roomId": "r2"}}"#,
        )
        .await;
        assert_eq!(data["roomId"], "r2");

        // Moving to r2 ran disconnect reconciliation against r1.
        assert_eq!(r1.occupant_count().await.unwrap(), 0);

        worker.close();
    }

    #[tokio::test]
    async fn test_transport_create_and_connect() {
        let (mut connection, worker) = connection();
        request(
            &mut connection,
            1,
            r#"{"seq": 1, "action": "join", "data": {"roomId": "r1"}}"#,
        )
        .await;

        let data = request(
            &mut connection,
            2,
            r#"{"seq": 2, "action": "createWebRtcTransport", "data": {"sender": true}}"#,
        )
        .await;
        let params = &data["params"];
        assert!(params["iceParameters"].is_object());
        assert!(params["iceCandidates"].is_array());
        let dtls = params["dtlsParameters"].clone();

        let connect = json!({
            "seq": 3,
            "action": "transport-connect",
            "data": { "dtlsParameters": dtls },
        });
        let data = request(&mut connection, 3, &connect.to_string()).await;
        assert_eq!(data, json!({}));

        worker.close();
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_reported() {
        let (mut connection, worker) = connection();
        request(
            &mut connection,
            1,
            r#"{"seq": 1, "action": "join", "data": {"roomId": "r1"}}"#,
        )
        .await;

        let produce = r#"{"seq": 2, "action": "transport-produce", "data": {"kind": "text", "rtpParameters": {"codecs": []}}}"#;
        let data = request(&mut connection, 2, produce).await;
        assert_eq!(data["error"], "kind not supported: text");

        worker.close();
    }

    #[tokio::test]
    async fn test_unknown_action_is_reported() {
        let (mut connection, worker) = connection();

        let data = request(
            &mut connection,
            9,
            r#"{"seq": 9, "action": "frobnicate"}"#,
        )
        .await;
        assert_eq!(data["error"], "unknown action: frobnicate");

        worker.close();
    }

    #[tokio::test]
    async fn test_malformed_frame_becomes_exception_event() {
        let (mut connection, worker) = connection();

        let (tx, _rx) = mpsc::channel(8);
        let frame = connection.handle_text("not json", &tx).await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "exception");

        worker.close();
    }
}
