//! Signaling service configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; `from_vars` takes a plain map for testing.

use crate::errors::SignalError;
use common::types::MediaKind;
use media_engine::types::RtpCodecCapability;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default announced IP for ICE candidates and the recording SDP.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default engine RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40_000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49_999;

/// Default muxer-side port range for recording streams.
pub const DEFAULT_RECORD_MIN_PORT: u16 = 10_000;
pub const DEFAULT_RECORD_MAX_PORT: u16 = 10_100;

/// Default deadline for a single engine capability call.
pub const DEFAULT_ENGINE_TIMEOUT_SECONDS: u64 = 10;

/// Default interval between worker resource-usage log lines.
pub const DEFAULT_RESOURCE_INTERVAL_SECONDS: u64 = 60;

/// Signaling service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// IP announced to clients in ICE candidates and used as the
    /// recording SDP connection address.
    pub announced_ip: String,

    /// Engine RTC port range (local transport sockets).
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Muxer-side port range for recording RTP/RTCP pairs.
    pub record_min_port: u16,
    pub record_max_port: u16,

    /// Directory recording container files are written to.
    pub recording_dir: PathBuf,

    /// Muxer binary (default: "ffmpeg").
    pub ffmpeg_bin: String,

    /// Deadline applied to every engine capability call.
    pub engine_timeout: Duration,

    /// Interval between worker resource-usage log lines.
    pub resource_interval: Duration,

    /// Codec capability list handed to every router.
    pub media_codecs: Vec<RtpCodecCapability>,

    /// Per-client transport bitrate settings.
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, SignalError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, SignalError> {
        let bind_address = vars
            .get("SIGNAL_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let announced_ip = vars
            .get("SIGNAL_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCED_IP.to_string());

        let rtc_min_port = parse_port(vars, "SIGNAL_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_port(vars, "SIGNAL_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        let record_min_port = parse_port(vars, "SIGNAL_RECORD_MIN_PORT", DEFAULT_RECORD_MIN_PORT)?;
        let record_max_port = parse_port(vars, "SIGNAL_RECORD_MAX_PORT", DEFAULT_RECORD_MAX_PORT)?;

        if rtc_min_port >= rtc_max_port {
            return Err(SignalError::Config(format!(
                "SIGNAL_RTC_MIN_PORT ({rtc_min_port}) must be below SIGNAL_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }
        if record_min_port >= record_max_port {
            return Err(SignalError::Config(format!(
                "SIGNAL_RECORD_MIN_PORT ({record_min_port}) must be below SIGNAL_RECORD_MAX_PORT ({record_max_port})"
            )));
        }

        let recording_dir = vars
            .get("SIGNAL_RECORDING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("files"));

        let ffmpeg_bin = vars
            .get("SIGNAL_FFMPEG_BIN")
            .cloned()
            .unwrap_or_else(|| "ffmpeg".to_string());

        let engine_timeout = Duration::from_secs(
            vars.get("SIGNAL_ENGINE_TIMEOUT_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_ENGINE_TIMEOUT_SECONDS),
        );

        let resource_interval = Duration::from_secs(
            vars.get("SIGNAL_RESOURCE_INTERVAL_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RESOURCE_INTERVAL_SECONDS),
        );

        Ok(Config {
            bind_address,
            announced_ip,
            rtc_min_port,
            rtc_max_port,
            record_min_port,
            record_max_port,
            recording_dir,
            ffmpeg_bin,
            engine_timeout,
            resource_interval,
            media_codecs: default_media_codecs(),
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
        })
    }
}

fn parse_port(
    vars: &HashMap<String, String>,
    key: &str,
    default: u16,
) -> Result<u16, SignalError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| SignalError::Config(format!("{key} is not a valid port: {raw}"))),
    }
}

/// Router codec set: Opus for audio, VP8 for video.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            preferred_payload_type: None,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            preferred_payload_type: None,
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.announced_ip, DEFAULT_ANNOUNCED_IP);
        assert_eq!(config.record_min_port, 10_000);
        assert_eq!(config.record_max_port, 10_100);
        assert_eq!(config.ffmpeg_bin, "ffmpeg");
        assert_eq!(config.engine_timeout, Duration::from_secs(10));
        assert_eq!(config.media_codecs.len(), 2);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            ("SIGNAL_BIND_ADDRESS".to_string(), "127.0.0.1:4000".to_string()),
            ("SIGNAL_ANNOUNCED_IP".to_string(), "192.0.2.10".to_string()),
            ("SIGNAL_RECORD_MIN_PORT".to_string(), "20000".to_string()),
            ("SIGNAL_RECORD_MAX_PORT".to_string(), "20100".to_string()),
            ("SIGNAL_FFMPEG_BIN".to_string(), "/usr/local/bin/ffmpeg".to_string()),
            ("SIGNAL_ENGINE_TIMEOUT_SECONDS".to_string(), "3".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("config should load");

        assert_eq!(config.bind_address, "127.0.0.1:4000");
        assert_eq!(config.announced_ip, "192.0.2.10");
        assert_eq!(config.record_min_port, 20_000);
        assert_eq!(config.record_max_port, 20_100);
        assert_eq!(config.ffmpeg_bin, "/usr/local/bin/ffmpeg");
        assert_eq!(config.engine_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let vars = HashMap::from([
            ("SIGNAL_RECORD_MIN_PORT".to_string(), "10100".to_string()),
            ("SIGNAL_RECORD_MAX_PORT".to_string(), "10000".to_string()),
        ]);

        assert!(matches!(
            Config::from_vars(&vars),
            Err(SignalError::Config(_))
        ));
    }

    #[test]
    fn test_unparseable_port_rejected() {
        let vars = HashMap::from([("SIGNAL_RTC_MIN_PORT".to_string(), "not-a-port".to_string())]);

        assert!(matches!(
            Config::from_vars(&vars),
            Err(SignalError::Config(_))
        ));
    }
}
