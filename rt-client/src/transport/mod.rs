//! Transport abstraction for rtwire.
//!
//! A transport carries [`ProtocolMessage`]s to and from one host. The
//! connection manager creates a fresh transport for every connection
//! attempt through a [`TransportFactory`], and learns what happens to it
//! through the [`TransportListener`] handed to [`Transport::connect`].
//!
//! # Design
//!
//! - `connect()` starts the attempt and returns once it is under way;
//!   progress is reported through the listener
//! - `send()` hands a message over without waiting for the network
//! - `close()` tears the transport down; no listener calls follow
//!
//! Every listener call is tagged with the transport it came from, so
//! notifications from a transport the manager has already replaced are
//! ignored.

mod mock;

pub use mock::{MockTransport, MockTransportFactory};

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rtwire_types::{codes, ErrorInfo, ProtocolMessage};
use thiserror::Error;

use crate::manager::Shared;
use crate::pipeline::Action;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,

    /// The server refused the connection.
    #[error("rejected: {0}")]
    Rejected(ErrorInfo),
}

impl TransportError {
    /// The reason reported to the connection state machine.
    ///
    /// Network-level failures map to 5xx statuses so that they are eligible
    /// for host fallback.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::ConnectionFailed(_) => {
                ErrorInfo::new(self.to_string(), codes::CONNECTION_FAILED, 503)
            }
            Self::NotConnected | Self::ConnectionClosed => {
                ErrorInfo::new(self.to_string(), codes::DISCONNECTED, 503)
            }
            Self::SendFailed(_) => ErrorInfo::new(self.to_string(), codes::CONNECTION_FAILED, 500),
            Self::Timeout => ErrorInfo::new(self.to_string(), codes::TIMEOUT, 504),
            Self::Rejected(info) => info.clone(),
        }
    }
}

/// How a transport asks the server to treat the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// New connection.
    Clean,
    /// Resume the connection identified by `key`.
    Resume {
        /// Connection key from the last `connected` message.
        key: String,
    },
    /// Recover a connection from another process.
    Recover {
        /// Connection key from the recovery key.
        key: String,
    },
}

impl ConnectMode {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Resume { .. } => "resume",
            Self::Recover { .. } => "recover",
        }
    }
}

/// Parameters for one connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Host to connect to.
    pub host: String,
    /// Connect mode.
    pub mode: ConnectMode,
    /// Query parameters from the auth provider.
    pub auth: Vec<(String, String)>,
}

impl std::fmt::Debug for TransportParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth_keys: Vec<&str> = self.auth.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("TransportParams")
            .field("host", &self.host)
            .field("mode", &self.mode.as_str())
            .field("auth", &format!("{auth_keys:?} [REDACTED]"))
            .finish()
    }
}

/// A connection to one host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting, reporting progress through `listener`.
    ///
    /// An error means the attempt never got under way.
    async fn connect(&self, listener: TransportListener) -> Result<(), TransportError>;

    /// Hand a message over for sending.
    ///
    /// Must not call back into the listener.
    fn send(&self, message: ProtocolMessage) -> Result<(), TransportError>;

    /// Tear the transport down.
    async fn close(&self);

    /// Host this transport actually connects to. Reported by
    /// [`ConnectionManager::host`](crate::ConnectionManager::host).
    fn host(&self) -> &str;
}

/// Creates a transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    /// Create an unconnected transport.
    fn create(&self, params: TransportParams) -> Arc<dyn Transport>;
}

/// Callbacks from one transport into its connection manager.
///
/// Holds only a weak reference, so a transport outliving its manager
/// reports into nothing.
#[derive(Clone)]
pub struct TransportListener {
    shared: Weak<Shared>,
    transport_id: u64,
}

impl TransportListener {
    pub(crate) fn new(shared: Weak<Shared>, transport_id: u64) -> Self {
        Self {
            shared,
            transport_id,
        }
    }

    /// The transport is up and waiting for the server's `connected`.
    pub fn on_available(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.submit(Action::TransportAvailable {
                transport_id: self.transport_id,
            });
        }
    }

    /// The transport failed or went away.
    pub fn on_unavailable(&self, reason: Option<ErrorInfo>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_transport_failure(self.transport_id, reason);
        }
    }

    /// A message arrived from the server.
    pub fn on_message(&self, message: ProtocolMessage) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_protocol_message(self.transport_id, message);
        }
    }
}

impl std::fmt::Debug for TransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportListener")
            .field("transport_id", &self.transport_id)
            .finish()
    }
}
