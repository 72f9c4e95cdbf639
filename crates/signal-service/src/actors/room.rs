//! Per-room actor.
//!
//! One actor owns all mutable state of one room: membership, the lazily
//! created router, per-client sessions, the room's producer slots and the
//! recording. Every mutation flows through the mailbox, so check-then-act
//! sequences (first-join router creation, producer replacement) are
//! race-free without locks.

use crate::actors::messages::{
    ConsumeReply, ConsumerParams, JoinReply, ProduceReply, RoomMessage, ServerEvent,
    TransportParams,
};
use crate::config::Config;
use crate::errors::{engine_call, SignalError};
use crate::recording::{MuxerEvent, PortAllocator, Recording, RecordingSettings};

use common::types::{ClientId, MediaKind, RoomId, TransportDirection};
use media_engine::types::{
    DtlsParameters, ListenIp, RtpCapabilities, RtpParameters, TransportConnectOptions,
    WebRtcTransportOptions,
};
use media_engine::{Consumer, EngineError, EngineWorker, Producer, Router, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAILBOX_CAPACITY: usize = 64;

/// Handle for interacting with a room actor.
#[derive(Debug, Clone)]
pub struct RoomActorHandle {
    room_id: RoomId,
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Join the room, registering `events` as the client's push channel.
    pub async fn join(
        &self,
        client_id: ClientId,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<JoinReply, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Join {
            client_id,
            events,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    /// The room router's capability descriptor.
    pub async fn router_rtp_capabilities(
        &self,
        client_id: ClientId,
    ) -> Result<RtpCapabilities, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::RtpCapabilities {
            client_id,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    pub async fn create_transport(
        &self,
        client_id: ClientId,
        direction: TransportDirection,
    ) -> Result<TransportParams, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::CreateTransport {
            client_id,
            direction,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    pub async fn connect_transport(
        &self,
        client_id: ClientId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::ConnectTransport {
            client_id,
            direction,
            dtls_parameters,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    pub async fn produce(
        &self,
        client_id: ClientId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProduceReply, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Produce {
            client_id,
            kind,
            rtp_parameters,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    pub async fn consume(
        &self,
        client_id: ClientId,
        kind: MediaKind,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeReply, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Consume {
            client_id,
            kind,
            rtp_capabilities,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    pub async fn resume_consumer(
        &self,
        client_id: ClientId,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::ResumeConsumer {
            client_id,
            kind,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    pub async fn start_recording(&self, client_id: ClientId) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::StartRecording {
            client_id,
            respond_to: tx,
        })
        .await?;
        self.recv(rx).await?
    }

    pub async fn stop_recording(&self) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::StopRecording { respond_to: tx }).await?;
        self.recv(rx).await?
    }

    /// Release everything the client owns. Total and idempotent; a dead
    /// actor counts as released.
    pub async fn disconnect(&self, client_id: ClientId) {
        let (tx, rx) = oneshot::channel();
        if self
            .send(RoomMessage::Disconnect {
                client_id,
                respond_to: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Occupancy by the displayed-count convention.
    pub async fn occupant_count(&self) -> Result<usize, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::OccupantCount { respond_to: tx }).await?;
        self.recv(rx).await
    }

    /// Signal the actor to shut down.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: RoomMessage) -> Result<(), SignalError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SignalError::Internal(format!("room {} actor unavailable", self.room_id)))
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, SignalError> {
        rx.await.map_err(|_| {
            SignalError::Internal(format!("room {} actor dropped the request", self.room_id))
        })
    }
}

/// The room's producer of one kind plus the client that published it.
struct ProducerSlot {
    owner: ClientId,
    producer: Arc<dyn Producer>,
}

/// Engine-side resources held for one connected client.
struct ClientSession {
    events: mpsc::Sender<ServerEvent>,
    send_transport: Option<Arc<dyn Transport>>,
    recv_transport: Option<Arc<dyn Transport>>,
    audio_consumer: Option<Arc<dyn Consumer>>,
    video_consumer: Option<Arc<dyn Consumer>>,
}

impl ClientSession {
    fn new(events: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            events,
            send_transport: None,
            recv_transport: None,
            audio_consumer: None,
            video_consumer: None,
        }
    }
}

/// Actor owning one room's state.
pub struct RoomActor {
    room_id: RoomId,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Clone handed to background tasks that report back to the mailbox.
    self_sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    worker: Arc<dyn EngineWorker>,
    config: Arc<Config>,
    port_allocator: Arc<PortAllocator>,

    router: Option<Arc<dyn Router>>,
    /// Join order of current members; drives the displayed count.
    members: Vec<ClientId>,
    sessions: HashMap<ClientId, ClientSession>,
    audio_producer: Option<ProducerSlot>,
    video_producer: Option<ProducerSlot>,
    recording: Option<Recording>,
}

impl RoomActor {
    /// Spawn a room actor, returning its handle and task.
    pub fn spawn(
        room_id: RoomId,
        worker: Arc<dyn EngineWorker>,
        config: Arc<Config>,
        port_allocator: Arc<PortAllocator>,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            worker,
            config,
            port_allocator,
            router: None,
            members: Vec::new(),
            sessions: HashMap::new(),
            audio_producer: None,
            video_producer: None,
            recording: None,
        };

        let handle = RoomActorHandle {
            room_id,
            sender,
            cancel_token,
        };

        let task = tokio::spawn(actor.run());

        (handle, task)
    }

    async fn run(mut self) {
        debug!(target: "room", room_id = %self.room_id, "room actor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                message = self.receiver.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
            }
        }

        self.shutdown().await;
        debug!(target: "room", room_id = %self.room_id, "room actor stopped");
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                client_id,
                events,
                respond_to,
            } => {
                let result = self.handle_join(client_id, events).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::RtpCapabilities {
                client_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_rtp_capabilities(client_id));
            }
            RoomMessage::CreateTransport {
                client_id,
                direction,
                respond_to,
            } => {
                let result = self.handle_create_transport(client_id, direction).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::ConnectTransport {
                client_id,
                direction,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(client_id, direction, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }
            RoomMessage::Produce {
                client_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self.handle_produce(client_id, kind, rtp_parameters).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::Consume {
                client_id,
                kind,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self.handle_consume(client_id, kind, rtp_capabilities).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::ResumeConsumer {
                client_id,
                kind,
                respond_to,
            } => {
                let result = self.handle_resume_consumer(client_id, kind).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::StartRecording {
                client_id,
                respond_to,
            } => {
                let result = self.handle_start_recording(client_id).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::StopRecording { respond_to } => {
                let result = self.handle_stop_recording().await;
                let _ = respond_to.send(result);
            }
            RoomMessage::Disconnect {
                client_id,
                respond_to,
            } => {
                self.handle_disconnect(client_id).await;
                let _ = respond_to.send(());
            }
            RoomMessage::OccupantCount { respond_to } => {
                let _ = respond_to.send(self.members.len().saturating_sub(1));
            }
            RoomMessage::MuxerExited {
                record_name,
                unexpected,
            } => {
                self.handle_muxer_exited(&record_name, unexpected).await;
            }
        }
    }

    /// Create the router on first use. Later calls are no-ops, so any
    /// number of concurrent first-joins resolve to one router.
    async fn ensure_router(&mut self) -> Result<(), SignalError> {
        if self.router.is_some() {
            return Ok(());
        }

        let router = engine_call(
            self.config.engine_timeout,
            "create router",
            self.worker.create_router(self.config.media_codecs.clone()),
        )
        .await?;

        info!(
            target: "room",
            room_id = %self.room_id,
            router_id = %router.id(),
            "router created"
        );
        self.router = Some(router);
        Ok(())
    }

    async fn handle_join(
        &mut self,
        client_id: ClientId,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<JoinReply, SignalError> {
        self.ensure_router().await?;

        if !self.members.contains(&client_id) {
            self.members.push(client_id);
        }
        match self.sessions.get_mut(&client_id) {
            Some(session) => session.events = events,
            None => {
                self.sessions.insert(client_id, ClientSession::new(events));
            }
        }

        let count = self.members.len().saturating_sub(1);
        info!(
            target: "room",
            room_id = %self.room_id,
            client_id = %client_id,
            count,
            "client joined"
        );

        self.broadcast_count();

        Ok(JoinReply {
            socket_id: client_id,
            room_id: self.room_id.clone(),
            count,
        })
    }

    fn handle_rtp_capabilities(
        &self,
        client_id: ClientId,
    ) -> Result<RtpCapabilities, SignalError> {
        self.session(&client_id, "join the room before requesting rtpCapabilities")?;
        let router = self.router.as_ref().ok_or_else(|| {
            SignalError::InvalidState("join the room before requesting rtpCapabilities".to_string())
        })?;
        Ok(router.rtp_capabilities())
    }

    async fn handle_create_transport(
        &mut self,
        client_id: ClientId,
        direction: TransportDirection,
    ) -> Result<TransportParams, SignalError> {
        self.session(&client_id, "join the room before creating a transport")?;
        let router = self.router.clone().ok_or_else(|| {
            SignalError::InvalidState("join the room before creating a transport".to_string())
        })?;

        let transport = engine_call(
            self.config.engine_timeout,
            "create transport",
            router.create_webrtc_transport(WebRtcTransportOptions {
                listen_ip: ListenIp {
                    ip: "0.0.0.0".to_string(),
                    announced_ip: Some(self.config.announced_ip.clone()),
                },
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                max_incoming_bitrate: self.config.max_incoming_bitrate,
                initial_available_outgoing_bitrate: self.config.initial_available_outgoing_bitrate,
            }),
        )
        .await?;

        let session = self.session_mut(&client_id)?;
        let slot = match direction {
            TransportDirection::Send => &mut session.send_transport,
            TransportDirection::Recv => &mut session.recv_transport,
        };
        if let Some(previous) = slot.take() {
            previous.close().await;
        }
        *slot = Some(Arc::clone(&transport));

        debug!(
            target: "room",
            room_id = %self.room_id,
            client_id = %client_id,
            transport_id = %transport.id(),
            direction = ?direction,
            "transport created"
        );

        Ok(TransportParams {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        })
    }

    async fn handle_connect_transport(
        &mut self,
        client_id: ClientId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalError> {
        let session = self.session(&client_id, "join the room before connecting a transport")?;
        let transport = match direction {
            TransportDirection::Send => session.send_transport.clone(),
            TransportDirection::Recv => session.recv_transport.clone(),
        }
        .ok_or_else(|| {
            SignalError::InvalidState(format!(
                "create the {} transport before connecting it",
                direction_name(direction)
            ))
        })?;

        engine_call(
            self.config.engine_timeout,
            "connect transport",
            transport.connect(TransportConnectOptions::Dtls(dtls_parameters)),
        )
        .await
    }

    async fn handle_produce(
        &mut self,
        client_id: ClientId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProduceReply, SignalError> {
        let session = self.session(&client_id, "join the room before producing")?;
        let transport = session.send_transport.clone().ok_or_else(|| {
            SignalError::InvalidState("create a send transport before producing".to_string())
        })?;

        let producer = engine_call(
            self.config.engine_timeout,
            "produce",
            transport.produce(kind, rtp_parameters),
        )
        .await?;

        // One producer per kind per room: a newer publication displaces
        // the old one, which is closed so it cannot be consumed again.
        let slot = match kind {
            MediaKind::Audio => &mut self.audio_producer,
            MediaKind::Video => &mut self.video_producer,
        };
        if let Some(previous) = slot.take() {
            previous.producer.close().await;
            info!(
                target: "room",
                room_id = %self.room_id,
                kind = kind.as_str(),
                displaced_producer = %previous.producer.id(),
                "producer replaced"
            );
        }
        *slot = Some(ProducerSlot {
            owner: client_id,
            producer: Arc::clone(&producer),
        });

        info!(
            target: "room",
            room_id = %self.room_id,
            client_id = %client_id,
            kind = kind.as_str(),
            producer_id = %producer.id(),
            "producer published"
        );

        Ok(ProduceReply { id: producer.id() })
    }

    async fn handle_consume(
        &mut self,
        client_id: ClientId,
        kind: MediaKind,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeReply, SignalError> {
        let session = self.session(&client_id, "join the room before consuming")?;
        let transport = session.recv_transport.clone().ok_or_else(|| {
            SignalError::InvalidState("create a receive transport before consuming".to_string())
        })?;
        let router = self.router.clone().ok_or_else(|| {
            SignalError::InvalidState("join the room before consuming".to_string())
        })?;
        let producer_id = match kind {
            MediaKind::Audio => self.audio_producer.as_ref(),
            MediaKind::Video => self.video_producer.as_ref(),
        }
        .map(|slot| slot.producer.id())
        .ok_or_else(|| {
            SignalError::InvalidState(format!("no {} producer in the room", kind.as_str()))
        })?;

        if !router.can_consume(producer_id, &rtp_capabilities).await {
            return Ok(ConsumeReply::Incompatible {
                error: "cannot consume the producer with the provided rtpCapabilities".to_string(),
            });
        }

        // Consumers start paused; the client resumes once its receive
        // side is wired up.
        let consumer = match tokio::time::timeout(
            self.config.engine_timeout,
            transport.consume(producer_id, rtp_capabilities, true),
        )
        .await
        {
            Ok(Ok(consumer)) => consumer,
            Ok(Err(EngineError::CannotConsume(message))) => {
                return Ok(ConsumeReply::Incompatible { error: message });
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(SignalError::EngineTimeout("consume")),
        };

        let session = self.session_mut(&client_id)?;
        let slot = match kind {
            MediaKind::Audio => &mut session.audio_consumer,
            MediaKind::Video => &mut session.video_consumer,
        };
        if let Some(previous) = slot.take() {
            previous.close().await;
        }
        *slot = Some(Arc::clone(&consumer));

        Ok(ConsumeReply::Ready(ConsumerParams {
            id: consumer.id(),
            producer_id,
            kind,
            rtp_parameters: consumer.rtp_parameters(),
        }))
    }

    async fn handle_resume_consumer(
        &mut self,
        client_id: ClientId,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        let session = self.session(&client_id, "join the room before resuming a consumer")?;
        let consumer = match kind {
            MediaKind::Audio => session.audio_consumer.clone(),
            MediaKind::Video => session.video_consumer.clone(),
        }
        .ok_or_else(|| {
            SignalError::InvalidState(format!("no {} consumer to resume", kind.as_str()))
        })?;

        engine_call(
            self.config.engine_timeout,
            "resume consumer",
            consumer.resume(),
        )
        .await
    }

    async fn handle_start_recording(&mut self, client_id: ClientId) -> Result<(), SignalError> {
        self.session(&client_id, "join the room before recording")?;
        if self.recording.is_some() {
            return Err(SignalError::InvalidState(
                "recording already in progress".to_string(),
            ));
        }
        let router = self.router.clone().ok_or_else(|| {
            SignalError::InvalidState("join the room before recording".to_string())
        })?;

        let audio = self
            .audio_producer
            .as_ref()
            .map(|slot| Arc::clone(&slot.producer));
        let video = self
            .video_producer
            .as_ref()
            .map(|slot| Arc::clone(&slot.producer));
        let (Some(audio), Some(video)) = (audio, video) else {
            return Err(SignalError::Recording(
                "the room needs both an audio and a video producer".to_string(),
            ));
        };

        let settings = RecordingSettings {
            announced_ip: self.config.announced_ip.clone(),
            recording_dir: self.config.recording_dir.clone(),
            ffmpeg_bin: self.config.ffmpeg_bin.clone(),
            engine_timeout: self.config.engine_timeout,
        };

        let (recording, mut events) =
            Recording::start(&router, &audio, &video, &self.port_allocator, &settings).await?;

        info!(
            target: "room",
            room_id = %self.room_id,
            client_id = %client_id,
            record_name = recording.record_name(),
            "recording started"
        );

        // Muxer exits arrive through the mailbox like everything else.
        let mailbox = self.self_sender.clone();
        let record_name = recording.record_name().to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MuxerEvent::Exited { success } => {
                        let _ = mailbox
                            .send(RoomMessage::MuxerExited {
                                record_name: record_name.clone(),
                                unexpected: !success,
                            })
                            .await;
                    }
                }
            }
        });

        self.recording = Some(recording);
        Ok(())
    }

    async fn handle_stop_recording(&mut self) -> Result<(), SignalError> {
        let Some(recording) = self.recording.take() else {
            return Err(SignalError::InvalidState(
                "no recording in progress".to_string(),
            ));
        };

        let record_name = recording.record_name().to_string();
        recording.stop(&self.port_allocator).await;
        info!(
            target: "room",
            room_id = %self.room_id,
            record_name = %record_name,
            "recording stopped"
        );
        Ok(())
    }

    async fn handle_muxer_exited(&mut self, record_name: &str, unexpected: bool) {
        // An explicit stop already took the slot, and its muxer's trailing
        // exit event may land after a new recording has started. Only the
        // exit of the recording currently in the slot means anything.
        let matches_current = self
            .recording
            .as_ref()
            .is_some_and(|rec| rec.record_name() == record_name);
        if !matches_current {
            debug!(
                target: "room",
                room_id = %self.room_id,
                record_name,
                "ignoring muxer exit for an inactive recording"
            );
            return;
        }
        let Some(recording) = self.recording.take() else {
            return;
        };

        warn!(
            target: "room",
            room_id = %self.room_id,
            record_name = recording.record_name(),
            unexpected,
            "recording muxer exited on its own"
        );
        recording.stop(&self.port_allocator).await;

        if unexpected {
            self.broadcast(ServerEvent::Exception {
                message: "Recording failed".to_string(),
            });
        }
    }

    async fn handle_disconnect(&mut self, client_id: ClientId) {
        let was_member = self.members.contains(&client_id);
        self.members.retain(|id| *id != client_id);

        let Some(session) = self.sessions.remove(&client_id) else {
            if was_member {
                self.broadcast_count();
            }
            return;
        };

        if let Some(transport) = session.send_transport {
            transport.close().await;
        }
        if let Some(transport) = session.recv_transport {
            transport.close().await;
        }

        for slot in [&mut self.audio_producer, &mut self.video_producer] {
            if slot.as_ref().is_some_and(|s| s.owner == client_id) {
                if let Some(owned) = slot.take() {
                    owned.producer.close().await;
                }
            }
        }

        if let Some(consumer) = session.audio_consumer {
            consumer.close().await;
        }
        if let Some(consumer) = session.video_consumer {
            consumer.close().await;
        }

        info!(
            target: "room",
            room_id = %self.room_id,
            client_id = %client_id,
            remaining = self.members.len(),
            "client disconnected"
        );

        self.broadcast_count();
    }

    async fn shutdown(&mut self) {
        if let Some(recording) = self.recording.take() {
            recording.stop(&self.port_allocator).await;
        }

        for (_, session) in self.sessions.drain() {
            if let Some(transport) = session.send_transport {
                transport.close().await;
            }
            if let Some(transport) = session.recv_transport {
                transport.close().await;
            }
        }
        for slot in [self.audio_producer.take(), self.video_producer.take()]
            .into_iter()
            .flatten()
        {
            slot.producer.close().await;
        }
        self.members.clear();
    }

    fn broadcast_count(&self) {
        let count = self.members.len().saturating_sub(1);
        self.broadcast(ServerEvent::CountUpdate { count });
    }

    /// Push an event to every session without waiting. A receiver that
    /// stopped draining its channel loses events; blocking here would
    /// stall the whole room behind it.
    fn broadcast(&self, event: ServerEvent) {
        for (client_id, session) in &self.sessions {
            match session.events.try_send(event.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        target: "room",
                        room_id = %self.room_id,
                        client_id = %client_id,
                        event = event.name(),
                        "event channel full, dropping event"
                    );
                }
            }
        }
    }

    fn session(
        &self,
        client_id: &ClientId,
        precondition: &str,
    ) -> Result<&ClientSession, SignalError> {
        self.sessions
            .get(client_id)
            .ok_or_else(|| SignalError::InvalidState(precondition.to_string()))
    }

    fn session_mut(&mut self, client_id: &ClientId) -> Result<&mut ClientSession, SignalError> {
        self.sessions
            .get_mut(client_id)
            .ok_or_else(|| SignalError::Internal(format!("no session for client {client_id}")))
    }
}

fn direction_name(direction: TransportDirection) -> &'static str {
    match direction {
        TransportDirection::Send => "send",
        TransportDirection::Recv => "receive",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use media_engine::loopback::{LoopbackWorker, WorkerSettings};
    use media_engine::types::RtpCodecParameters;
    use std::collections::HashMap as StdHashMap;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::from_vars(&StdHashMap::new()).unwrap())
    }

    fn spawn_room(worker: &Arc<LoopbackWorker>) -> (RoomActorHandle, JoinHandle<()>) {
        let worker: Arc<dyn EngineWorker> = Arc::clone(worker) as Arc<dyn EngineWorker>;
        RoomActor::spawn(
            RoomId::from("test-room"),
            worker,
            test_config(),
            Arc::new(PortAllocator::new(10_000, 10_100)),
            CancellationToken::new(),
        )
    }

    fn audio_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48_000,
                channels: Some(2),
            }],
        }
    }

    fn video_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
            }],
        }
    }

    async fn join(handle: &RoomActorHandle) -> (ClientId, mpsc::Receiver<ServerEvent>) {
        let client_id = ClientId::new();
        let (tx, rx) = mpsc::channel(16);
        handle.join(client_id, tx).await.unwrap();
        (client_id, rx)
    }

    async fn producing_client(handle: &RoomActorHandle) -> (ClientId, mpsc::Receiver<ServerEvent>) {
        let (client_id, rx) = join(handle).await;
        let params = handle
            .create_transport(client_id, TransportDirection::Send)
            .await
            .unwrap();
        handle
            .connect_transport(
                client_id,
                TransportDirection::Send,
                params.dtls_parameters.unwrap(),
            )
            .await
            .unwrap();
        (client_id, rx)
    }

    #[tokio::test]
    async fn test_join_count_convention() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let a = ClientId::new();
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let reply = handle.join(a, a_tx).await.unwrap();
        assert_eq!(reply.count, 0);
        assert_eq!(reply.socket_id, a);

        // First join broadcasts the new occupancy to everyone, including
        // the joiner.
        assert_eq!(a_rx.recv().await.unwrap(), ServerEvent::CountUpdate { count: 0 });

        let b = ClientId::new();
        let (b_tx, _b_rx) = mpsc::channel(16);
        let reply = handle.join(b, b_tx).await.unwrap();
        assert_eq!(reply.count, 1);

        assert_eq!(a_rx.recv().await.unwrap(), ServerEvent::CountUpdate { count: 1 });
        assert_eq!(handle.occupant_count().await.unwrap(), 1);

        worker.close();
    }

    #[tokio::test]
    async fn test_slow_event_receiver_does_not_stall_the_room() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        // a registers a tiny event channel and never drains it.
        let a = ClientId::new();
        let (a_tx, mut a_rx) = mpsc::channel(1);
        handle.join(a, a_tx).await.unwrap();

        // Far more broadcasts than a's channel can hold.
        for _ in 0..8 {
            let b = ClientId::new();
            let (b_tx, _b_rx) = mpsc::channel(1);
            handle.join(b, b_tx).await.unwrap();
            handle.disconnect(b).await;
        }

        // The room keeps answering instead of parking on a's full channel.
        let count = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            handle.occupant_count(),
        )
        .await
        .expect("room actor stalled on a slow event receiver")
        .unwrap();
        assert_eq!(count, 0);

        // The event a did buffer is still there.
        assert_eq!(a_rx.recv().await.unwrap(), ServerEvent::CountUpdate { count: 0 });

        worker.close();
    }

    #[tokio::test]
    async fn test_concurrent_joins_create_one_router() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let mut joins = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(16);
                handle.join(ClientId::new(), tx).await
            }));
        }
        for task in joins {
            task.await.unwrap().unwrap();
        }

        assert_eq!(worker.routers_created(), 1);
        worker.close();
    }

    #[tokio::test]
    async fn test_operations_before_join_are_invalid_state() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let stranger = ClientId::new();
        assert!(matches!(
            handle.router_rtp_capabilities(stranger).await,
            Err(SignalError::InvalidState(_))
        ));
        assert!(matches!(
            handle
                .create_transport(stranger, TransportDirection::Send)
                .await,
            Err(SignalError::InvalidState(_))
        ));
        assert!(matches!(
            handle
                .consume(stranger, MediaKind::Video, RtpCapabilities::default())
                .await,
            Err(SignalError::InvalidState(_))
        ));

        worker.close();
    }

    #[tokio::test]
    async fn test_produce_requires_send_transport() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let (client_id, _rx) = join(&handle).await;
        let result = handle
            .produce(client_id, MediaKind::Video, video_parameters())
            .await;

        assert!(matches!(result, Err(SignalError::InvalidState(_))));
        worker.close();
    }

    #[tokio::test]
    async fn test_second_producer_displaces_first() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let (a, _a_rx) = producing_client(&handle).await;
        let first = handle
            .produce(a, MediaKind::Video, video_parameters())
            .await
            .unwrap();

        let (b, _b_rx) = producing_client(&handle).await;
        let second = handle
            .produce(b, MediaKind::Video, video_parameters())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        // A consumer now binds to the replacement.
        let (c, _c_rx) = join(&handle).await;
        handle
            .create_transport(c, TransportDirection::Recv)
            .await
            .unwrap();
        let reply = handle
            .consume(
                c,
                MediaKind::Video,
                RtpCapabilities {
                    codecs: crate::config::default_media_codecs(),
                },
            )
            .await
            .unwrap();
        match reply {
            ConsumeReply::Ready(params) => assert_eq!(params.producer_id, second.id),
            ConsumeReply::Incompatible { error } => panic!("unexpected incompatibility: {error}"),
        }

        worker.close();
    }

    #[tokio::test]
    async fn test_consume_incompatible_capabilities() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let (a, _a_rx) = producing_client(&handle).await;
        handle
            .produce(a, MediaKind::Video, video_parameters())
            .await
            .unwrap();

        let (b, _b_rx) = join(&handle).await;
        handle
            .create_transport(b, TransportDirection::Recv)
            .await
            .unwrap();

        // Audio-only capabilities cannot consume the video producer.
        let audio_only = RtpCapabilities {
            codecs: crate::config::default_media_codecs()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
        };
        let reply = handle.consume(b, MediaKind::Video, audio_only).await.unwrap();
        assert!(matches!(reply, ConsumeReply::Incompatible { .. }));

        // The session survives; a compatible retry succeeds.
        let reply = handle
            .consume(
                b,
                MediaKind::Video,
                RtpCapabilities {
                    codecs: crate::config::default_media_codecs(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, ConsumeReply::Ready(_)));

        worker.close();
    }

    #[tokio::test]
    async fn test_consume_then_resume() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let (a, _a_rx) = producing_client(&handle).await;
        handle
            .produce(a, MediaKind::Audio, audio_parameters())
            .await
            .unwrap();

        let (b, _b_rx) = join(&handle).await;
        handle
            .create_transport(b, TransportDirection::Recv)
            .await
            .unwrap();
        let reply = handle
            .consume(
                b,
                MediaKind::Audio,
                RtpCapabilities {
                    codecs: crate::config::default_media_codecs(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, ConsumeReply::Ready(_)));

        handle.resume_consumer(b, MediaKind::Audio).await.unwrap();

        assert!(matches!(
            handle.resume_consumer(b, MediaKind::Video).await,
            Err(SignalError::InvalidState(_))
        ));

        worker.close();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_updates_count() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let (_a, mut a_rx) = join(&handle).await;
        let (b, _b_rx) = join(&handle).await;
        assert_eq!(a_rx.recv().await.unwrap(), ServerEvent::CountUpdate { count: 0 });
        assert_eq!(a_rx.recv().await.unwrap(), ServerEvent::CountUpdate { count: 1 });

        handle.disconnect(b).await;
        assert_eq!(a_rx.recv().await.unwrap(), ServerEvent::CountUpdate { count: 0 });
        assert_eq!(handle.occupant_count().await.unwrap(), 0);

        // Disconnecting again (or a never-joined client) is a no-op.
        handle.disconnect(b).await;
        handle.disconnect(ClientId::new()).await;
        assert_eq!(handle.occupant_count().await.unwrap(), 0);

        assert_eq!(worker.routers_created(), 1);
        worker.close();
    }

    #[tokio::test]
    async fn test_disconnect_closes_owned_producer() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let (a, _a_rx) = producing_client(&handle).await;
        handle
            .produce(a, MediaKind::Video, video_parameters())
            .await
            .unwrap();

        handle.disconnect(a).await;

        // The slot is gone, so consuming reports a missing producer.
        let (b, _b_rx) = join(&handle).await;
        handle
            .create_transport(b, TransportDirection::Recv)
            .await
            .unwrap();
        let result = handle
            .consume(
                b,
                MediaKind::Video,
                RtpCapabilities {
                    codecs: crate::config::default_media_codecs(),
                },
            )
            .await;
        assert!(matches!(result, Err(SignalError::InvalidState(_))));

        worker.close();
    }

    #[tokio::test]
    async fn test_recording_requires_both_producers() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let (handle, _task) = spawn_room(&worker);

        let (a, _a_rx) = producing_client(&handle).await;
        handle
            .produce(a, MediaKind::Video, video_parameters())
            .await
            .unwrap();

        assert!(matches!(
            handle.start_recording(a).await,
            Err(SignalError::Recording(_))
        ));
        assert!(matches!(
            handle.stop_recording().await,
            Err(SignalError::InvalidState(_))
        ));

        worker.close();
    }
}
