//! In-process loopback engine.
//!
//! Implements the full capability surface without forwarding a single
//! packet: handles are bookkeeping objects with engine-shaped semantics
//! (capability gating, paused consumers, idempotent close). It backs
//! development setups and every test in the workspace; a packet-moving
//! engine backend plugs in behind the same traits.

use crate::engine::{Consumer, EngineError, EngineWorker, Producer, Router, Transport};
use crate::types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, PlainTransportOptions,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    TransportConnectOptions, TransportTuple, WebRtcTransportOptions,
};

use async_trait::async_trait;
use common::types::MediaKind;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Settings for a loopback worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Lower bound of the local port range handed to transports.
    pub rtc_min_port: u16,
    /// Upper bound (inclusive) of the local port range.
    pub rtc_max_port: u16,
    /// Interval between resource-usage log lines.
    pub resource_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 40_000,
            rtc_max_port: 49_999,
            resource_interval: Duration::from_secs(60),
        }
    }
}

/// Sequential local-port source shared by all transports of one worker.
#[derive(Debug)]
struct PortCounter {
    min: u16,
    span: u16,
    next: AtomicU16,
}

impl PortCounter {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            span: max.saturating_sub(min).saturating_add(1),
            next: AtomicU16::new(0),
        }
    }

    fn next(&self) -> u16 {
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.span.max(1);
        self.min.saturating_add(offset)
    }
}

/// In-process engine worker.
pub struct LoopbackWorker {
    id: String,
    closed: CancellationToken,
    ports: Arc<PortCounter>,
    routers_created: AtomicUsize,
}

impl LoopbackWorker {
    /// Start a worker and its resource-usage log loop.
    #[must_use]
    pub fn spawn(settings: WorkerSettings) -> Arc<Self> {
        let worker = Arc::new(Self {
            id: format!("loopback-{}", Uuid::new_v4().simple()),
            closed: CancellationToken::new(),
            ports: Arc::new(PortCounter::new(settings.rtc_min_port, settings.rtc_max_port)),
            routers_created: AtomicUsize::new(0),
        });

        let monitor = Arc::clone(&worker);
        let interval = settings.resource_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = monitor.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(
                            target: "engine.worker",
                            worker_id = %monitor.id,
                            routers = monitor.routers_created.load(Ordering::Relaxed),
                            "worker resource usage"
                        );
                    }
                }
            }
        });

        worker
    }

    /// Shut the worker down, firing its `closed()` token.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Total routers created over the worker's lifetime.
    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EngineWorker for LoopbackWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError> {
        if self.closed.is_cancelled() {
            return Err(EngineError::Closed);
        }

        // Assign preferred payload types to codecs that do not carry one,
        // starting from the dynamic range.
        let mut next_payload_type: u8 = 100;
        let codecs = media_codecs
            .into_iter()
            .map(|mut codec| {
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect::<Vec<_>>();

        self.routers_created.fetch_add(1, Ordering::Relaxed);

        let router = Arc::new(LoopbackRouter {
            id: Uuid::new_v4(),
            capabilities: RtpCapabilities { codecs },
            producers: Arc::new(Mutex::new(HashMap::new())),
            ports: Arc::clone(&self.ports),
        });

        debug!(target: "engine.worker", worker_id = %self.id, router_id = %router.id, "router created");

        Ok(router)
    }
}

struct LoopbackRouter {
    id: Uuid,
    capabilities: RtpCapabilities,
    /// All live producers of this router, looked up during `consume`.
    producers: Arc<Mutex<HashMap<Uuid, Arc<LoopbackProducer>>>>,
    ports: Arc<PortCounter>,
}

impl LoopbackRouter {
    /// Compatibility rule: the requested capabilities contain a codec whose
    /// mime type matches one of the producer's codecs.
    fn compatible(producer: &LoopbackProducer, rtp_capabilities: &RtpCapabilities) -> bool {
        producer.rtp_parameters.codecs.iter().any(|produced| {
            rtp_capabilities
                .codecs
                .iter()
                .any(|offered| offered.matches_mime(&produced.mime_type))
        })
    }
}

#[async_trait]
impl Router for LoopbackRouter {
    fn id(&self) -> Uuid {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let ip = options.listen_ip.ip.clone();
        let announced = options
            .listen_ip
            .announced_ip
            .unwrap_or_else(|| ip.clone());
        let port = self.ports.next();

        let mut rng = rand::thread_rng();
        let ice = IceParameters {
            username_fragment: format!("{:08x}", rng.gen::<u32>()),
            password: format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>()),
            ice_lite: true,
        };
        let candidates = vec![IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1_076_302_079,
            ip: announced,
            protocol: "udp".to_string(),
            port,
            candidate_type: "host".to_string(),
        }];
        let fingerprint_bytes: [u8; 32] = rng.gen();
        let dtls = DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: fingerprint_bytes
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<Vec<_>>()
                    .join(":"),
            }],
        };

        Ok(Arc::new(LoopbackTransport {
            id: Uuid::new_v4(),
            ice_parameters: Some(ice),
            ice_candidates: candidates,
            dtls_parameters: Some(dtls),
            producers: Arc::clone(&self.producers),
            router_capabilities: self.capabilities.clone(),
            state: Mutex::new(TransportState {
                tuple: Some(TransportTuple {
                    local_ip: ip,
                    local_port: port,
                    remote_ip: None,
                    remote_port: None,
                    protocol: "udp".to_string(),
                }),
                rtcp_tuple: None,
                connected: false,
                closed: false,
                children_producers: Vec::new(),
                children_consumers: Vec::new(),
            }),
        }))
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let ip = options.listen_ip.ip.clone();
        let rtp_port = self.ports.next();
        let rtcp_tuple = if options.rtcp_mux {
            None
        } else {
            Some(TransportTuple {
                local_ip: ip.clone(),
                local_port: self.ports.next(),
                remote_ip: None,
                remote_port: None,
                protocol: "udp".to_string(),
            })
        };

        Ok(Arc::new(LoopbackTransport {
            id: Uuid::new_v4(),
            ice_parameters: None,
            ice_candidates: Vec::new(),
            dtls_parameters: None,
            producers: Arc::clone(&self.producers),
            router_capabilities: self.capabilities.clone(),
            state: Mutex::new(TransportState {
                tuple: Some(TransportTuple {
                    local_ip: ip,
                    local_port: rtp_port,
                    remote_ip: None,
                    remote_port: None,
                    protocol: "udp".to_string(),
                }),
                rtcp_tuple,
                connected: false,
                closed: false,
                children_producers: Vec::new(),
                children_consumers: Vec::new(),
            }),
        }))
    }

    async fn can_consume(&self, producer_id: Uuid, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = self.producers.lock().await;
        match producers.get(&producer_id) {
            Some(producer) if !producer.is_closed() => {
                Self::compatible(producer, rtp_capabilities)
            }
            _ => false,
        }
    }
}

struct TransportState {
    tuple: Option<TransportTuple>,
    rtcp_tuple: Option<TransportTuple>,
    connected: bool,
    closed: bool,
    children_producers: Vec<Arc<LoopbackProducer>>,
    children_consumers: Vec<Arc<LoopbackConsumer>>,
}

struct LoopbackTransport {
    id: Uuid,
    ice_parameters: Option<IceParameters>,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: Option<DtlsParameters>,
    producers: Arc<Mutex<HashMap<Uuid, Arc<LoopbackProducer>>>>,
    router_capabilities: RtpCapabilities,
    state: Mutex<TransportState>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> Uuid {
        self.id
    }

    fn ice_parameters(&self) -> Option<IceParameters> {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> Option<DtlsParameters> {
        self.dtls_parameters.clone()
    }

    fn tuple(&self) -> Option<TransportTuple> {
        self.state.try_lock().ok().and_then(|s| s.tuple.clone())
    }

    fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.state.try_lock().ok().and_then(|s| s.rtcp_tuple.clone())
    }

    async fn connect(&self, options: TransportConnectOptions) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(EngineError::Closed);
        }

        match (options, self.ice_parameters.is_some()) {
            (TransportConnectOptions::Dtls(_), true) => {
                state.connected = true;
                Ok(())
            }
            (TransportConnectOptions::Plain(remote), false) => {
                if let Some(tuple) = state.tuple.as_mut() {
                    tuple.remote_ip = Some(remote.ip.clone());
                    tuple.remote_port = Some(remote.port);
                }
                if let (Some(rtcp), Some(rtcp_port)) = (state.rtcp_tuple.as_mut(), remote.rtcp_port)
                {
                    rtcp.remote_ip = Some(remote.ip);
                    rtcp.remote_port = Some(rtcp_port);
                }
                state.connected = true;
                Ok(())
            }
            _ => Err(EngineError::Operation(
                "connect options do not match the transport variant".to_string(),
            )),
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(EngineError::Closed);
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Operation(
                "rtpParameters carry no codec".to_string(),
            ));
        }

        let producer = Arc::new(LoopbackProducer {
            id: Uuid::new_v4(),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
        });

        state.children_producers.push(Arc::clone(&producer));
        drop(state);

        self.producers
            .lock()
            .await
            .insert(producer.id, Arc::clone(&producer));

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        {
            let state = self.state.lock().await;
            if state.closed {
                return Err(EngineError::Closed);
            }
        }

        let producer = {
            let producers = self.producers.lock().await;
            producers
                .get(&producer_id)
                .filter(|p| !p.is_closed())
                .cloned()
                .ok_or_else(|| {
                    EngineError::Operation(format!("producer {producer_id} not found"))
                })?
        };

        if !LoopbackRouter::compatible(&producer, &rtp_capabilities) {
            return Err(EngineError::CannotConsume(
                "no codec shared between producer and rtpCapabilities".to_string(),
            ));
        }

        // The consumer inherits the producer's codecs restricted to what
        // the requester offered, re-numbered against the router's
        // preferred payload types.
        let codecs = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|produced| {
                rtp_capabilities
                    .codecs
                    .iter()
                    .any(|offered| offered.matches_mime(&produced.mime_type))
            })
            .map(|produced| RtpCodecParameters {
                mime_type: produced.mime_type.clone(),
                payload_type: self
                    .router_capabilities
                    .codecs
                    .iter()
                    .find(|c| c.matches_mime(&produced.mime_type))
                    .and_then(|c| c.preferred_payload_type)
                    .unwrap_or(produced.payload_type),
                clock_rate: produced.clock_rate,
                channels: produced.channels,
            })
            .collect::<Vec<_>>();

        let consumer = Arc::new(LoopbackConsumer {
            id: Uuid::new_v4(),
            producer_id,
            kind: producer.kind,
            rtp_parameters: RtpParameters { codecs },
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });

        self.state
            .lock()
            .await
            .children_consumers
            .push(Arc::clone(&consumer));

        Ok(consumer)
    }

    async fn close(&self) {
        let (producers, consumers) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.children_producers),
                std::mem::take(&mut state.children_consumers),
            )
        };

        // A transport close closes everything produced or consumed on it.
        for producer in producers {
            producer.close().await;
        }
        for consumer in consumers {
            consumer.close().await;
        }
    }
}

struct LoopbackProducer {
    id: Uuid,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for LoopbackProducer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct LoopbackConsumer {
    id: Uuid,
    producer_id: Uuid,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn producer_id(&self) -> Uuid {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
