//! Channel seam.
//!
//! The channel feature layer lives outside this crate. The connection
//! manager routes channel-scoped inbound messages to a [`ChannelRegistry`]
//! and tells it when the connection's state changes what channels may do.

use rtwire_types::{ErrorInfo, ProtocolMessage};

/// The set of channels multiplexed over the connection.
pub trait ChannelRegistry: Send + Sync {
    /// A channel-scoped message arrived.
    fn on_channel_message(&self, message: ProtocolMessage);

    /// The connection is up.
    fn set_connected(&self);

    /// Suspend attaching and attached channels.
    ///
    /// `resume_failed` is set when the server could not continue the
    /// previous connection, so message continuity was lost.
    fn set_suspended(&self, reason: &ErrorInfo, resume_failed: bool);

    /// Re-attach after a successful resume.
    fn reattach(&self, reason: Option<&ErrorInfo>);

    /// Detach every channel after a close.
    fn detach_all(&self, reason: &ErrorInfo);

    /// Fail every channel after a fatal error.
    fn fail_all(&self, reason: &ErrorInfo);

    /// Names of the known channels, logged when the manager suspends or
    /// reattaches them.
    fn channel_names(&self) -> Vec<String>;
}

/// Registry with no channels. Channel messages are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChannels;

impl ChannelRegistry for NoChannels {
    fn on_channel_message(&self, message: ProtocolMessage) {
        tracing::debug!(
            action = ?message.action,
            channel = ?message.channel,
            "no channel registry; dropping message"
        );
    }

    fn set_connected(&self) {}

    fn set_suspended(&self, _reason: &ErrorInfo, _resume_failed: bool) {}

    fn reattach(&self, _reason: Option<&ErrorInfo>) {}

    fn detach_all(&self, _reason: &ErrorInfo) {}

    fn fail_all(&self, _reason: &ErrorInfo) {}

    fn channel_names(&self) -> Vec<String> {
        Vec::new()
    }
}
