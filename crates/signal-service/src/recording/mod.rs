//! Room recording pipeline.
//!
//! Recording republishes the room's audio and video producers over plain
//! RTP transports aimed at a spawned muxer process. The flow is:
//! allocate muxer-side port pairs, create and connect one plain transport
//! per stream, consume each producer paused, render the SDP, feed it to
//! the muxer, and only then resume the consumers so no media is sent
//! before the muxer is listening.

/// Module for the muxer process runner
pub mod ffmpeg;

/// Module for muxer-side port allocation
pub mod ports;

/// Module for SDP text generation
pub mod sdp;

pub use ffmpeg::{FfmpegProcess, MuxerEvent};
pub use ports::{PortAllocator, PortPair};

use crate::errors::{engine_call, SignalError};

use media_engine::types::{
    ListenIp, PlainConnectOptions, PlainTransportOptions, TransportConnectOptions,
};
use media_engine::{Consumer, Producer, Router, Transport};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Settings the pipeline needs from service configuration.
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    /// Connection address written into the SDP; the muxer and the engine
    /// are reachable from each other at this IP.
    pub announced_ip: String,
    pub recording_dir: PathBuf,
    pub ffmpeg_bin: String,
    pub engine_timeout: Duration,
}

/// One producer republished toward the muxer: the plain transport, the
/// paused consumer on it, and the muxer-side port pair it targets.
pub struct StreamPublish {
    pub transport: Arc<dyn Transport>,
    pub consumer: Arc<dyn Consumer>,
    pub ports: PortPair,
}

/// An active recording: both republished streams plus the muxer process.
pub struct Recording {
    record_name: String,
    output: PathBuf,
    video: StreamPublish,
    audio: StreamPublish,
    process: FfmpegProcess,
}

/// Random recording name, e.g. `recording-04217`.
#[must_use]
pub fn generate_record_name() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("recording-{n:05}")
}

/// Republish one producer over a fresh plain transport.
///
/// The consumer is created paused and uses a single-codec capability set
/// derived from the router, so its negotiated parameters match what the
/// SDP advertises to the muxer.
///
/// # Errors
///
/// Engine failures and port exhaustion; allocated ports are released on
/// every failure path.
pub async fn publish_producer_stream(
    router: &Arc<dyn Router>,
    producer: &Arc<dyn Producer>,
    port_allocator: &PortAllocator,
    settings: &RecordingSettings,
) -> Result<StreamPublish, SignalError> {
    let pair = port_allocator.allocate_pair().await?;

    match publish_on_ports(router, producer, pair, settings).await {
        Ok(publish) => Ok(publish),
        Err(e) => {
            port_allocator.release_pair(pair).await;
            Err(e)
        }
    }
}

async fn publish_on_ports(
    router: &Arc<dyn Router>,
    producer: &Arc<dyn Producer>,
    pair: PortPair,
    settings: &RecordingSettings,
) -> Result<StreamPublish, SignalError> {
    let transport = engine_call(
        settings.engine_timeout,
        "create plain transport",
        router.create_plain_transport(PlainTransportOptions {
            listen_ip: ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some(settings.announced_ip.clone()),
            },
            rtcp_mux: false,
            comedia: false,
        }),
    )
    .await?;

    let connected = engine_call(
        settings.engine_timeout,
        "connect plain transport",
        transport.connect(TransportConnectOptions::Plain(PlainConnectOptions {
            ip: settings.announced_ip.clone(),
            port: pair.rtp,
            rtcp_port: Some(pair.rtcp),
        })),
    )
    .await;
    if let Err(e) = connected {
        transport.close().await;
        return Err(e);
    }

    let kind = producer.kind();
    let capabilities = match router.rtp_capabilities().codec_of_kind(kind) {
        Some(codec) => media_engine::types::RtpCapabilities {
            codecs: vec![codec.clone()],
        },
        None => {
            transport.close().await;
            return Err(SignalError::Recording(format!(
                "router has no {} codec to record",
                kind.as_str()
            )));
        }
    };

    let consumer = engine_call(
        settings.engine_timeout,
        "consume for recording",
        transport.consume(producer.id(), capabilities, true),
    )
    .await;
    let consumer = match consumer {
        Ok(consumer) => consumer,
        Err(e) => {
            transport.close().await;
            return Err(e);
        }
    };

    debug!(
        target: "recording",
        kind = kind.as_str(),
        rtp_port = pair.rtp,
        rtcp_port = pair.rtcp,
        transport_id = %transport.id(),
        "producer republished for recording"
    );

    Ok(StreamPublish {
        transport,
        consumer,
        ports: pair,
    })
}

impl Recording {
    /// Start recording the given audio and video producers.
    ///
    /// Returns the recording plus the muxer event channel; the caller
    /// forwards exit events back into its own mailbox. Consumers are
    /// resumed only after the muxer has accepted the SDP.
    ///
    /// # Errors
    ///
    /// Any pipeline step failing tears down everything built so far.
    pub async fn start(
        router: &Arc<dyn Router>,
        audio_producer: &Arc<dyn Producer>,
        video_producer: &Arc<dyn Producer>,
        port_allocator: &PortAllocator,
        settings: &RecordingSettings,
    ) -> Result<(Self, mpsc::Receiver<MuxerEvent>), SignalError> {
        let video = publish_producer_stream(router, video_producer, port_allocator, settings).await?;

        let audio =
            match publish_producer_stream(router, audio_producer, port_allocator, settings).await {
                Ok(audio) => audio,
                Err(e) => {
                    teardown_publish(video, port_allocator).await;
                    return Err(e);
                }
            };

        match Self::start_muxer(video, audio, settings).await {
            Ok(ok) => Ok(ok),
            Err((video, audio, e)) => {
                teardown_publish(video, port_allocator).await;
                teardown_publish(audio, port_allocator).await;
                Err(e)
            }
        }
    }

    async fn start_muxer(
        video: StreamPublish,
        audio: StreamPublish,
        settings: &RecordingSettings,
    ) -> Result<(Self, mpsc::Receiver<MuxerEvent>), (StreamPublish, StreamPublish, SignalError)>
    {
        let video_params = video.consumer.rtp_parameters();
        let audio_params = audio.consumer.rtp_parameters();

        let sdp_text = match sdp::create_sdp_text(
            &settings.announced_ip,
            &sdp::SdpStream {
                kind: common::types::MediaKind::Video,
                port: video.ports.rtp,
                rtp_parameters: &video_params,
            },
            &sdp::SdpStream {
                kind: common::types::MediaKind::Audio,
                port: audio.ports.rtp,
                rtp_parameters: &audio_params,
            },
        ) {
            Ok(sdp_text) => sdp_text,
            Err(e) => return Err((video, audio, e)),
        };

        if let Err(e) = tokio::fs::create_dir_all(&settings.recording_dir).await {
            return Err((
                video,
                audio,
                SignalError::Recording(format!(
                    "cannot create recording directory {}: {e}",
                    settings.recording_dir.display()
                )),
            ));
        }

        let record_name = generate_record_name();
        let output = settings.recording_dir.join(format!("{record_name}.webm"));

        let (process, events) = match ffmpeg::launch(&settings.ffmpeg_bin, &sdp_text, &output).await
        {
            Ok(ok) => ok,
            Err(e) => return Err((video, audio, e)),
        };

        // The muxer holds the full SDP now; delivery can begin.
        let mut resume_error = None;
        for publish in [&video, &audio] {
            match engine_call(
                settings.engine_timeout,
                "resume recording consumer",
                publish.consumer.resume(),
            )
            .await
            {
                Ok(()) => {
                    let _ = publish.consumer.request_key_frame().await;
                }
                Err(e) => {
                    resume_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = resume_error {
            process.stop();
            return Err((video, audio, e));
        }

        info!(
            target: "recording",
            record_name = %record_name,
            output = %output.display(),
            pid = ?process.pid(),
            "recording started"
        );

        Ok((
            Self {
                record_name,
                output,
                video,
                audio,
                process,
            },
            events,
        ))
    }

    /// Name of the recording (output file stem).
    #[must_use]
    pub fn record_name(&self) -> &str {
        &self.record_name
    }

    /// Path of the container file being written.
    #[must_use]
    pub fn output_path(&self) -> &std::path::Path {
        &self.output
    }

    /// Stop the recording: close both republished streams, release their
    /// ports and terminate the muxer. The muxer flushes the container on
    /// termination; its final exit event still reaches the caller.
    pub async fn stop(self, port_allocator: &PortAllocator) {
        info!(target: "recording", record_name = %self.record_name, "stopping recording");
        teardown_publish(self.video, port_allocator).await;
        teardown_publish(self.audio, port_allocator).await;
        self.process.stop();
    }
}

async fn teardown_publish(publish: StreamPublish, port_allocator: &PortAllocator) {
    publish.consumer.close().await;
    publish.transport.close().await;
    port_allocator.release_pair(publish.ports).await;
}
