//! Error types for rtwire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding or decoding wire values.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Base64 text could not be decoded
    #[error("invalid base64: {0}")]
    Base64(#[source] base64::DecodeError),
}

/// Protocol error codes used by the connection core.
pub mod codes {
    /// Generic bad request.
    pub const BAD_REQUEST: u32 = 40000;
    /// Generic internal error.
    pub const INTERNAL: u32 = 50000;
    /// Timed out waiting for a server response.
    pub const TIMEOUT: u32 = 50003;
    /// Connection failed.
    pub const CONNECTION_FAILED: u32 = 80000;
    /// Connection suspended.
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    /// Connection disconnected.
    pub const DISCONNECTED: u32 = 80003;
    /// Resume or recover was refused by the server.
    pub const RESUME_FAILED: u32 = 80008;
    /// Connection closed.
    pub const CONNECTION_CLOSED: u32 = 80017;
}

/// An error reported by the server or synthesized by the connection core.
///
/// `status_code` follows HTTP semantics; zero means "no status".
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} (code {code}, status {status_code})")]
pub struct ErrorInfo {
    /// Protocol error code.
    pub code: u32,
    /// HTTP-style status code, 0 if absent.
    pub status_code: u16,
    /// Human-readable description.
    pub message: String,
}

impl ErrorInfo {
    /// Create a new error.
    pub fn new(message: impl Into<String>, code: u32, status_code: u16) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Whether the status indicates a server-side (5xx) problem.
    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }

    /// Default reason for the `disconnected` state.
    pub fn disconnected() -> Self {
        Self::new("Connection temporarily unavailable", codes::DISCONNECTED, 503)
    }

    /// Default reason for the `suspended` state.
    pub fn suspended() -> Self {
        Self::new(
            "Connection to server unavailable",
            codes::CONNECTION_SUSPENDED,
            503,
        )
    }

    /// Default reason for the `closing` and `closed` states.
    pub fn closed() -> Self {
        Self::new("Connection closed", codes::CONNECTION_CLOSED, 400)
    }

    /// Default reason for the `failed` state.
    pub fn failed() -> Self {
        Self::new("Connection failed", codes::CONNECTION_FAILED, 400)
    }

    /// A resume or recover attempt landed on a different connection.
    pub fn resume_failed() -> Self {
        Self::new("Unable to resume connection", codes::RESUME_FAILED, 400)
    }

    /// No heartbeat response arrived in time.
    pub fn heartbeat_timeout() -> Self {
        Self::new(
            "Timeout waiting for heartbeat response",
            codes::TIMEOUT,
            500,
        )
    }

    /// The transport was silent for longer than the negotiated idle interval.
    pub fn idle_timeout(silent_ms: u128) -> Self {
        Self::new(
            format!("No activity seen from realtime in {silent_ms} ms"),
            codes::DISCONNECTED,
            503,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ErrorInfo::disconnected();
        assert_eq!(
            err.to_string(),
            "Connection temporarily unavailable (code 80003, status 503)"
        );
    }

    #[test]
    fn server_error_threshold() {
        assert!(ErrorInfo::new("x", 50000, 500).is_server_error());
        assert!(ErrorInfo::new("x", 50300, 503).is_server_error());
        assert!(!ErrorInfo::new("x", 40000, 400).is_server_error());
        assert!(!ErrorInfo::new("x", 80000, 0).is_server_error());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ErrorInfo>();
        assert_send_sync::<WireError>();
    }
}
