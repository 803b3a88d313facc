//! Protocol messages carried by a transport.
//!
//! Only the fields the connection core reads or writes are modelled; channel
//! payloads travel as opaque bytes in [`ProtocolMessage::data`].

use serde::{Deserialize, Serialize};

use crate::{ErrorInfo, WireError};

/// Discriminator for a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolAction {
    /// Keepalive probe or response
    Heartbeat,
    /// Server acknowledges a range of serials
    Ack,
    /// Server rejects a range of serials
    Nack,
    /// Client requests a connection
    Connect,
    /// Server confirms a connection (or a reauthorization)
    Connected,
    /// Client requests a disconnect
    Disconnect,
    /// Server announces a disconnect
    Disconnected,
    /// Client requests a graceful close
    Close,
    /// Server confirms a graceful close
    Closed,
    /// Error, connection-wide when no channel is set
    Error,
    /// Channel attach request
    Attach,
    /// Channel attach confirmation
    Attached,
    /// Channel detach request
    Detach,
    /// Channel detach confirmation
    Detached,
    /// Presence update
    Presence,
    /// Channel message
    Message,
    /// Presence sync
    Sync,
    /// In-band authentication
    Auth,
}

impl ProtocolAction {
    /// Whether messages with this action are assigned a serial and must be
    /// acknowledged by the server.
    pub fn ack_required(self) -> bool {
        matches!(self, Self::Message | Self::Presence)
    }
}

/// Connection parameters negotiated by the server in a `connected` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    /// Key presented on resume
    pub connection_key: Option<String>,
    /// Client identity confirmed by the server
    pub client_id: Option<String>,
    /// Longest interval the server may stay silent, in milliseconds
    pub max_idle_interval_ms: Option<u64>,
    /// How long the server keeps connection state after a disconnect, in milliseconds
    pub connection_state_ttl_ms: Option<u64>,
}

/// Credentials sent with an in-band `auth` message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDetails {
    /// Bearer token
    pub access_token: String,
}

impl std::fmt::Debug for AuthDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthDetails")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// A single framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// What kind of message this is
    pub action: ProtocolAction,
    /// Channel the message belongs to, if any
    pub channel: Option<String>,
    /// Server-assigned connection id (`connected`)
    pub connection_id: Option<String>,
    /// Negotiated connection parameters (`connected`)
    pub connection_details: Option<ConnectionDetails>,
    /// Serial of an outbound message, or the first serial of an ack/nack range
    pub msg_serial: Option<u64>,
    /// Length of an ack/nack range
    pub count: Option<u32>,
    /// Error carried by the message
    pub error: Option<ErrorInfo>,
    /// In-band credentials (`auth`)
    pub auth: Option<AuthDetails>,
    /// Opaque channel payload
    pub data: Option<Vec<u8>>,
}

impl ProtocolMessage {
    /// Create a message with only the action set.
    pub fn new(action: ProtocolAction) -> Self {
        Self {
            action,
            channel: None,
            connection_id: None,
            connection_details: None,
            msg_serial: None,
            count: None,
            error: None,
            auth: None,
            data: None,
        }
    }

    /// A channel message with an opaque payload.
    pub fn message(channel: &str, data: Vec<u8>) -> Self {
        let mut msg = Self::new(ProtocolAction::Message);
        msg.channel = Some(channel.to_string());
        msg.data = Some(data);
        msg
    }

    /// A heartbeat.
    pub fn heartbeat() -> Self {
        Self::new(ProtocolAction::Heartbeat)
    }

    /// A graceful close request.
    pub fn close() -> Self {
        Self::new(ProtocolAction::Close)
    }

    /// An in-band authentication message.
    pub fn auth(access_token: &str) -> Self {
        let mut msg = Self::new(ProtocolAction::Auth);
        msg.auth = Some(AuthDetails {
            access_token: access_token.to_string(),
        });
        msg
    }

    /// A `connected` message, as a server would send it.
    pub fn connected(connection_id: &str, details: ConnectionDetails) -> Self {
        let mut msg = Self::new(ProtocolAction::Connected);
        msg.connection_id = Some(connection_id.to_string());
        msg.connection_details = Some(details);
        msg
    }

    /// An ack covering `count` serials starting at `msg_serial`.
    pub fn ack(msg_serial: u64, count: u32) -> Self {
        let mut msg = Self::new(ProtocolAction::Ack);
        msg.msg_serial = Some(msg_serial);
        msg.count = Some(count);
        msg
    }

    /// A nack covering `count` serials starting at `msg_serial`.
    pub fn nack(msg_serial: u64, count: u32, error: Option<ErrorInfo>) -> Self {
        let mut msg = Self::new(ProtocolAction::Nack);
        msg.msg_serial = Some(msg_serial);
        msg.count = Some(count);
        msg.error = error;
        msg
    }

    /// Attach an error to this message.
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach a channel name to this message.
    pub fn with_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_message_and_presence_need_acks() {
        assert!(ProtocolAction::Message.ack_required());
        assert!(ProtocolAction::Presence.ack_required());
        assert!(!ProtocolAction::Heartbeat.ack_required());
        assert!(!ProtocolAction::Attach.ack_required());
        assert!(!ProtocolAction::Close.ack_required());
    }

    #[test]
    fn connected_message_survives_codec() {
        let msg = ProtocolMessage::connected(
            "conn-1",
            ConnectionDetails {
                connection_key: Some("key-1".into()),
                client_id: None,
                max_idle_interval_ms: Some(15_000),
                connection_state_ttl_ms: Some(120_000),
            },
        );

        let bytes = msg.to_bytes().unwrap();
        let restored = ProtocolMessage::from_bytes(&bytes).unwrap();

        assert_eq!(restored, msg);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result = ProtocolMessage::from_bytes(&[0xc1, 0x00, 0x13]);
        assert!(matches!(result, Err(WireError::Deserialization(_))));
    }

    #[test]
    fn action_uses_snake_case_in_json() {
        let json = serde_json::to_string(&ProtocolAction::Heartbeat).unwrap();
        assert_eq!(json, "\"heartbeat\"");
    }

    #[test]
    fn auth_debug_redacts_token() {
        let msg = ProtocolMessage::auth("super-secret-token");
        let debug = format!("{:?}", msg);
        assert!(debug.contains("REDACTED"));
        assert!(
            !debug.contains("super-secret-token"),
            "token must not appear in Debug output"
        );
    }
}
