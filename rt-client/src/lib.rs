//! # rtwire-client
//!
//! Connection manager for the rtwire realtime messaging core.
//!
//! This crate owns the single logical connection between an application and
//! the realtime service. It drives the connection through its lifecycle,
//! multiplexes outbound messages onto whatever transport is current, and
//! makes sure every message is submitted at most once and eventually
//! acknowledged or failed, across transport failures, host fallback and
//! reconnection.
//!
//! ## Features
//!
//! - **Serialized state machine**: one worker task per connection applies
//!   every state change in order, using the pure state table from
//!   `rtwire-core`
//! - **Host fallback**: server-side failures move the attempt to a shuffled
//!   fallback host while the network is reachable
//! - **Resume and recover**: a dropped connection resumes with its key; a
//!   recovery key carries it across processes
//! - **Transport abstraction**: pluggable transports, with a scriptable mock
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rtwire_client::{Collaborators, ConnectionManager, ConnectionOptions};
//! use rtwire_types::ProtocolMessage;
//!
//! let options = ConnectionOptions::from_file("rtwire.toml".as_ref())?;
//! let manager = ConnectionManager::new(options, Collaborators::new(Arc::new(my_transports)))?;
//!
//! manager.connect();
//! manager
//!     .send_and_wait(ProtocolMessage::message("chat", b"hi".to_vec()), true)
//!     .await?;
//! manager.close_and_wait().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod channels;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod manager;
mod pipeline;
pub mod transport;

pub use auth::{AuthProvider, NoAuth, TokenAuth};
pub use channels::{ChannelRegistry, NoChannels};
pub use config::{ConfigError, ConnectionOptions, EndpointConfig, QueueConfig, TimeoutConfig};
pub use connectivity::{AssumeOnline, ConnectivityCheck, HttpConnectivityCheck};
pub use error::ClientError;
pub use manager::{Collaborators, CompletionCallback, ConnectionManager};
pub use transport::{
    ConnectMode, MockTransport, MockTransportFactory, Transport, TransportError, TransportFactory,
    TransportListener, TransportParams,
};

// Re-export the types callers need alongside the manager.
pub use rtwire_core::{ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use rtwire_types::{ErrorInfo, ProtocolMessage};
