//! Server-assigned connection identity and the recovery key derived from it.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::{ProtocolMessage, WireError};

/// Identity of the current server-side connection.
///
/// Replaced wholesale on every `connected` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    /// Server-assigned connection id.
    pub id: String,
    /// Key presented when resuming this connection.
    pub key: Option<String>,
    /// Longest interval the server may stay silent.
    pub max_idle_interval: Option<Duration>,
    /// How long the server preserves state after a disconnect.
    pub connection_state_ttl: Option<Duration>,
}

impl ConnectionIdentity {
    /// Extract the identity from a `connected` message.
    ///
    /// Returns `None` when the message carries no connection id.
    pub fn from_connected(msg: &ProtocolMessage) -> Option<Self> {
        let id = msg.connection_id.clone()?;
        let details = msg.connection_details.clone().unwrap_or_default();
        Some(Self {
            id,
            key: details.connection_key,
            max_idle_interval: details.max_idle_interval_ms.map(Duration::from_millis),
            connection_state_ttl: details
                .connection_state_ttl_ms
                .map(Duration::from_millis),
        })
    }
}

/// Opaque token that lets a new process recover a previous connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryKey {
    /// Resume key of the connection being recovered
    pub connection_key: String,
    /// Id of the connection being recovered
    pub connection_id: String,
    /// Next outbound serial on that connection
    pub msg_serial: u64,
}

impl RecoveryKey {
    /// Encode as URL-safe base64 over MessagePack.
    pub fn encode(&self) -> Result<String, WireError> {
        let bytes = rmp_serde::to_vec(self).map_err(WireError::Serialization)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Decode a key produced by [`RecoveryKey::encode`].
    pub fn decode(encoded: &str) -> Result<Self, WireError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(WireError::Base64)?;
        rmp_serde::from_slice(&bytes).map_err(WireError::Deserialization)
    }
}

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryKey")
            .field("connection_key", &"[REDACTED]")
            .field("connection_id", &self.connection_id)
            .field("msg_serial", &self.msg_serial)
            .finish()
    }
}
