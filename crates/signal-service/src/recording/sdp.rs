//! SDP text generation for the recording muxer.
//!
//! The muxer learns where the recorded RTP streams will arrive from a
//! session description fed to it over stdin. Each recorded stream is a
//! single-codec `sendonly` media section; the ports are the muxer-side
//! ports the plain transports were connected to.

use crate::errors::SignalError;

use common::types::MediaKind;
use media_engine::types::RtpParameters;
use std::fmt::Write as _;

/// One media section of the recording SDP.
#[derive(Debug, Clone)]
pub struct SdpStream<'a> {
    pub kind: MediaKind,
    /// Muxer-side RTP port.
    pub port: u16,
    /// The consumer's negotiated RTP parameters; the first codec entry
    /// drives the `m=`/`a=rtpmap` lines.
    pub rtp_parameters: &'a RtpParameters,
}

/// Render the SDP for a video/audio recording pair.
///
/// # Errors
///
/// Returns [`SignalError::Recording`] when a stream has no codec entry.
pub fn create_sdp_text(
    connection_ip: &str,
    video: &SdpStream<'_>,
    audio: &SdpStream<'_>,
) -> Result<String, SignalError> {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    let _ = write!(sdp, "o=- 0 0 IN IP4 {connection_ip}\r\n");
    sdp.push_str("s=FFmpeg\r\n");
    let _ = write!(sdp, "c=IN IP4 {connection_ip}\r\n");
    sdp.push_str("t=0 0\r\n");
    write_media_section(&mut sdp, video)?;
    write_media_section(&mut sdp, audio)?;
    Ok(sdp)
}

fn write_media_section(sdp: &mut String, stream: &SdpStream<'_>) -> Result<(), SignalError> {
    let codec = stream
        .rtp_parameters
        .codecs
        .first()
        .ok_or_else(|| {
            SignalError::Recording(format!(
                "{} stream has no negotiated codec",
                stream.kind.as_str()
            ))
        })?;

    // "video/VP8" -> "VP8"
    let codec_name = codec
        .mime_type
        .split('/')
        .nth(1)
        .unwrap_or(codec.mime_type.as_str());

    let _ = write!(
        sdp,
        "m={} {} RTP/AVP {}\r\n",
        stream.kind.as_str(),
        stream.port,
        codec.payload_type
    );
    match stream.kind {
        MediaKind::Audio => {
            let channels = codec.channels.unwrap_or(2);
            let _ = write!(
                sdp,
                "a=rtpmap:{} {codec_name}/{}/{channels}\r\n",
                codec.payload_type, codec.clock_rate
            );
        }
        MediaKind::Video => {
            let _ = write!(
                sdp,
                "a=rtpmap:{} {codec_name}/{}\r\n",
                codec.payload_type, codec.clock_rate
            );
        }
    }
    sdp.push_str("a=sendonly\r\n");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use media_engine::types::RtpCodecParameters;

    fn params(mime: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: mime.to_string(),
                payload_type,
                clock_rate,
                channels,
            }],
        }
    }

    #[test]
    fn test_sdp_contains_both_streams() {
        let video_params = params("video/VP8", 101, 90_000, None);
        let audio_params = params("audio/opus", 100, 48_000, Some(2));

        let sdp = create_sdp_text(
            "192.0.2.10",
            &SdpStream {
                kind: MediaKind::Video,
                port: 10_020,
                rtp_parameters: &video_params,
            },
            &SdpStream {
                kind: MediaKind::Audio,
                port: 10_040,
                rtp_parameters: &audio_params,
            },
        )
        .unwrap();

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 192.0.2.10\r\n"));
        assert!(sdp.contains("m=video 10020 RTP/AVP 101\r\n"));
        assert!(sdp.contains("a=rtpmap:101 VP8/90000\r\n"));
        assert!(sdp.contains("m=audio 10040 RTP/AVP 100\r\n"));
        assert!(sdp.contains("a=rtpmap:100 opus/48000/2\r\n"));
        assert_eq!(sdp.matches("a=sendonly\r\n").count(), 2);
    }

    #[test]
    fn test_video_section_precedes_audio() {
        let video_params = params("video/VP8", 101, 90_000, None);
        let audio_params = params("audio/opus", 100, 48_000, Some(2));

        let sdp = create_sdp_text(
            "127.0.0.1",
            &SdpStream {
                kind: MediaKind::Video,
                port: 10_000,
                rtp_parameters: &video_params,
            },
            &SdpStream {
                kind: MediaKind::Audio,
                port: 10_002,
                rtp_parameters: &audio_params,
            },
        )
        .unwrap();

        let video_at = sdp.find("m=video").unwrap();
        let audio_at = sdp.find("m=audio").unwrap();
        assert!(video_at < audio_at);
    }

    #[test]
    fn test_missing_codec_is_an_error() {
        let empty = RtpParameters { codecs: vec![] };
        let video_params = params("video/VP8", 101, 90_000, None);

        let result = create_sdp_text(
            "127.0.0.1",
            &SdpStream {
                kind: MediaKind::Video,
                port: 10_000,
                rtp_parameters: &video_params,
            },
            &SdpStream {
                kind: MediaKind::Audio,
                port: 10_002,
                rtp_parameters: &empty,
            },
        );

        assert!(matches!(result, Err(SignalError::Recording(_))));
    }
}
