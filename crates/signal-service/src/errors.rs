//! Signaling service error types.
//!
//! Operation-level failures are caught at the signaling-handler boundary
//! and returned to clients as structured payloads. Internal details are
//! logged server-side; `client_message` is the only text that crosses the
//! wire.

use media_engine::EngineError;
use thiserror::Error;

/// Signaling service error type.
#[derive(Debug, Error)]
pub enum SignalError {
    /// An operation was invoked before its precondition held
    /// (e.g. `consume` before `join`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The requested media kind is not `audio` or `video`.
    #[error("kind not supported: {0}")]
    KindNotSupported(String),

    /// Room not found.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Some other resource (client session, consumer, …) not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The media engine failed an operation.
    #[error("engine error: {0}")]
    Engine(String),

    /// An engine call exceeded its deadline.
    #[error("engine call timed out: {0}")]
    EngineTimeout(&'static str),

    /// The recording pipeline failed.
    #[error("recording error: {0}")]
    Recording(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failures and the like).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalError {
    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalError::InvalidState(msg) => msg.clone(),
            SignalError::KindNotSupported(kind) => format!("kind not supported: {kind}"),
            SignalError::RoomNotFound(_) => "Room not found".to_string(),
            SignalError::NotFound(_) => "Not found".to_string(),
            SignalError::Recording(msg) => format!("Recording failed: {msg}"),
            SignalError::Engine(_)
            | SignalError::EngineTimeout(_)
            | SignalError::Config(_)
            | SignalError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<EngineError> for SignalError {
    fn from(err: EngineError) -> Self {
        SignalError::Engine(err.to_string())
    }
}

/// Run one engine capability call under the configured deadline.
///
/// A stalled engine must surface as an operation failure rather than
/// wedge the calling actor.
pub(crate) async fn engine_call<T>(
    deadline: std::time::Duration,
    what: &'static str,
    fut: impl std::future::Future<Output = Result<T, EngineError>>,
) -> Result<T, SignalError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(SignalError::from),
        Err(_) => Err(SignalError::EngineTimeout(what)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_hide_internal_details() {
        let engine_err = SignalError::Engine("udp bind failed on 10.1.2.3:40000".to_string());
        assert!(!engine_err.client_message().contains("10.1.2.3"));
        assert_eq!(engine_err.client_message(), "An internal error occurred");

        let internal = SignalError::Internal("channel send failed".to_string());
        assert_eq!(internal.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_precondition_messages_pass_through() {
        let err = SignalError::InvalidState("join the room before consuming".to_string());
        assert_eq!(err.client_message(), "join the room before consuming");
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: SignalError = EngineError::Closed.into();
        assert!(matches!(err, SignalError::Engine(_)));
    }
}
