//! Wire protocol of the signaling channel.
//!
//! Requests arrive as `{ "seq": n, "action": "...", "data": { … } }` and
//! are answered with `{ "seq": n, "data": { … } }`; the client correlates
//! by `seq`. Server-initiated events carry no `seq`:
//! `{ "event": "...", "data": { … } }`. Handler failures become
//! `{ "seq": n, "data": { "error": "..." } }` so the socket stays usable.

use crate::actors::messages::ServerEvent;
use crate::errors::SignalError;

use media_engine::types::{DtlsParameters, RtpCapabilities, RtpParameters};
use serde::Deserialize;
use serde_json::{json, Value};

/// Request envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parse one incoming text frame.
    pub fn parse(text: &str) -> Result<Self, SignalError> {
        serde_json::from_str(text)
            .map_err(|e| SignalError::InvalidState(format!("malformed message: {e}")))
    }

    /// Deserialize the payload for the matched action.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, SignalError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            SignalError::InvalidState(format!("invalid {} payload: {e}", self.action))
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransportRequest {
    /// `true` requests the client-to-server (send) transport.
    pub sender: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: String,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub kind: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Deserialize)]
pub struct ResumeConsumerRequest {
    pub kind: String,
}

/// Successful reply frame.
#[must_use]
pub fn reply_frame(seq: u64, data: Value) -> String {
    json!({ "seq": seq, "data": data }).to_string()
}

/// Error reply frame; only the client-safe message crosses the wire.
#[must_use]
pub fn error_frame(seq: u64, error: &SignalError) -> String {
    json!({ "seq": seq, "data": { "error": error.client_message() } }).to_string()
}

/// Server-initiated event frame.
#[must_use]
pub fn event_frame(event: &ServerEvent) -> String {
    json!({ "event": event.name(), "data": event }).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses_action_and_payload() {
        let envelope =
            Envelope::parse(r#"{"seq": 3, "action": "join", "data": {"roomId": "r1"}}"#).unwrap();
        assert_eq!(envelope.seq, 3);
        assert_eq!(envelope.action, "join");

        let payload: JoinRequest = envelope.payload().unwrap();
        assert_eq!(payload.room_id, "r1");
    }

    #[test]
    fn test_envelope_data_defaults_to_null() {
        let envelope = Envelope::parse(r#"{"seq": 1, "action": "getRtpCapabilities"}"#).unwrap();
        assert!(envelope.data.is_null());
    }

    #[test]
    fn test_malformed_message_is_invalid_state() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(SignalError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reply_and_error_frames() {
        let frame = reply_frame(7, json!({"id": "x"}));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["data"]["id"], "x");

        let frame = error_frame(8, &SignalError::Internal("secret detail".to_string()));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["data"]["error"], "An internal error occurred");
    }

    #[test]
    fn test_event_frame_shape() {
        let frame = event_frame(&ServerEvent::CountUpdate { count: 2 });
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "count-update");
        assert_eq!(value["data"]["count"], 2);
        assert!(value.get("seq").is_none());
    }
}
