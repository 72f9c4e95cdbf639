//! RTP/ICE/DTLS parameter types exchanged with clients and the engine.
//!
//! Field names serialize in camelCase because these structs cross the wire
//! verbatim inside signaling replies (capability descriptors, transport
//! parameters, consumer parameters).

use common::types::MediaKind;
use serde::{Deserialize, Serialize};

/// One codec an endpoint is able to send or receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    /// Full mime type, e.g. `"audio/opus"` or `"video/VP8"`.
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

impl RtpCodecCapability {
    /// Case-insensitive mime-type match, the basis of every
    /// capability-compatibility check.
    #[must_use]
    pub fn matches_mime(&self, other: &str) -> bool {
        self.mime_type.eq_ignore_ascii_case(other)
    }
}

/// Negotiated capability set of a router or a requesting endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// The first codec of the given kind, if any.
    #[must_use]
    pub fn codec_of_kind(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.kind == kind)
    }
}

/// One codec within concrete RTP send/receive parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// Concrete RTP parameters of a producer or consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
}

/// ICE parameters of a WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

/// One ICE candidate of a WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

/// DTLS role of one side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// One DTLS certificate fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS handshake parameters exchanged during `transport-connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Local/remote address pair of a transport socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTuple {
    pub local_ip: String,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub protocol: String,
}

/// Listen address for engine-created transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
}

/// Options for an interactive (ICE/DTLS) WebRTC transport.
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: ListenIp,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

/// Options for a non-interactive plain RTP transport (recording side).
#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: ListenIp,
    /// When false the transport uses a separate RTCP socket, and
    /// `rtcp_tuple` is populated.
    pub rtcp_mux: bool,
    /// When false the remote address must be given via `connect`.
    pub comedia: bool,
}

/// Remote endpoint of a plain transport, supplied via `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainConnectOptions {
    pub ip: String,
    pub port: u16,
    pub rtcp_port: Option<u16>,
}

/// Parameters accepted by [`crate::Transport::connect`].
///
/// Interactive transports take the peer's DTLS parameters; plain
/// transports take the remote RTP/RTCP endpoint.
#[derive(Debug, Clone)]
pub enum TransportConnectOptions {
    Dtls(DtlsParameters),
    Plain(PlainConnectOptions),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_wire_shape_is_camel_case() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
                preferred_payload_type: Some(100),
            }],
        };

        let json = serde_json::to_value(&caps).unwrap();
        let codec = &json["codecs"][0];
        assert_eq!(codec["mimeType"], "audio/opus");
        assert_eq!(codec["clockRate"], 48_000);
        assert_eq!(codec["preferredPayloadType"], 100);
    }

    #[test]
    fn test_mime_match_is_case_insensitive() {
        let codec = RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            preferred_payload_type: None,
        };

        assert!(codec.matches_mime("video/vp8"));
        assert!(!codec.matches_mime("video/h264"));
    }

    #[test]
    fn test_ice_candidate_type_field_rename() {
        let candidate = IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1_076_302_079,
            ip: "10.0.0.1".to_string(),
            protocol: "udp".to_string(),
            port: 44_444,
            candidate_type: "host".to_string(),
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["type"], "host");
    }
}
