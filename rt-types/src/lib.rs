//! # rtwire-types
//!
//! Protocol types shared by the rtwire connection core:
//! - [`ProtocolMessage`] / [`ProtocolAction`] - the framed messages a transport carries
//! - [`ErrorInfo`] - the error value reported to callers and listeners
//! - [`ConnectionIdentity`] / [`RecoveryKey`] - server-assigned connection identity
//! - [`WireError`] - codec errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod identity;
mod messages;

pub use error::{codes, ErrorInfo, WireError};
pub use identity::{ConnectionIdentity, RecoveryKey};
pub use messages::{AuthDetails, ConnectionDetails, ProtocolAction, ProtocolMessage};
