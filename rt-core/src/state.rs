//! Connection state table for rtwire.
//!
//! This module is the pure half of the connection state machine. Each
//! [`ConnectionState`] has a stateless [`StateDescriptor`] plus three pure
//! functions keyed by the state:
//!
//! - [`ConnectionState::validate`] decides whether a [`StateChangeRequest`] is
//!   legal from the current state, possibly rewriting it
//! - [`ConnectionState::on_timeout`] names the follow-up when the state's timer
//!   expires
//! - [`StateTable::enact`] lists the [`Effect`]s of entering a state
//!
//! The actual I/O (opening transports, notifying channels, failing queued
//! messages) is performed by `rtwire-client`, which interprets the effects.

use std::fmt;
use std::time::Duration;

use rtwire_types::ErrorInfo;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, never connected.
    Initialized,
    /// A transport is being opened.
    Connecting,
    /// The server confirmed the connection.
    Connected,
    /// Lost the connection, expecting to resume.
    Disconnected,
    /// Lost the connection for longer than the state TTL.
    Suspended,
    /// Waiting for the server to confirm a close.
    Closing,
    /// Closed on request. Terminal.
    Closed,
    /// Failed with a fatal error. Terminal.
    Failed,
}

impl ConnectionState {
    /// Every state, in declaration order.
    pub const ALL: [ConnectionState; 8] = [
        Self::Initialized,
        Self::Connecting,
        Self::Connected,
        Self::Disconnected,
        Self::Suspended,
        Self::Closing,
        Self::Closed,
        Self::Failed,
    ];

    /// Lower-case name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further automatic activity happens once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Validate a request against this (current) state.
    ///
    /// Pure: the same state and request always produce the same verdict.
    pub fn validate(self, request: StateChangeRequest) -> Verdict {
        let target = request.state;
        match self {
            Self::Initialized if target == Self::Initialized => Verdict::Reject,
            Self::Initialized | Self::Connecting => Verdict::Transition(request),

            // A repeated `connected` acknowledges a reauthorization.
            Self::Connected if target == Self::Connected => Verdict::Update(request),
            Self::Connected => Verdict::Transition(request),

            Self::Disconnected | Self::Suspended if target == self => Verdict::Reject,
            // No live transport, so there is nothing to hand-shake a close with.
            Self::Disconnected | Self::Suspended if target == Self::Closing => {
                Verdict::Transition(request.retarget(Self::Closed))
            }
            Self::Disconnected | Self::Suspended => Verdict::Transition(request),

            Self::Closing => match target {
                Self::Closing => Verdict::Reject,
                Self::Disconnected | Self::Suspended => {
                    Verdict::Transition(request.retarget(Self::Closed))
                }
                _ => Verdict::Transition(request),
            },

            // Only connect() leads out of a terminal state.
            Self::Closed | Self::Failed if target == Self::Connecting => {
                Verdict::Transition(request)
            }
            Self::Closed | Self::Failed => Verdict::Reject,
        }
    }

    /// The follow-up when this state's timer expires, if any.
    pub fn on_timeout(self) -> Option<TimeoutTransition> {
        match self {
            Self::Connecting => Some(TimeoutTransition::CheckSuspend),
            Self::Disconnected | Self::Suspended => Some(TimeoutTransition::Request(
                StateChangeRequest::new(Self::Connecting),
            )),
            Self::Closing => Some(TimeoutTransition::Request(StateChangeRequest::new(
                Self::Closed,
            ))),
            Self::Initialized | Self::Connected | Self::Closed | Self::Failed => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static attributes of a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDescriptor {
    /// The state described.
    pub state: ConnectionState,
    /// Outbound messages may be buffered for later.
    pub queue_events: bool,
    /// Outbound messages may be sent immediately.
    pub send_events: bool,
    /// No further automatic activity once entered.
    pub terminal: bool,
    /// Time after which the state's timeout follow-up fires.
    pub timeout: Option<Duration>,
    /// Reason reported when none is supplied.
    pub default_error: Option<ErrorInfo>,
}

/// Timer durations for the states that have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTimeouts {
    /// Time allowed for a connection attempt.
    pub connect: Duration,
    /// Delay before retrying from `disconnected`.
    pub disconnected_retry: Duration,
    /// Delay before retrying from `suspended`.
    pub suspended_retry: Duration,
    /// Time allowed for the server to confirm a close.
    pub close: Duration,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            disconnected_retry: Duration::from_secs(15),
            suspended_retry: Duration::from_secs(30),
            close: Duration::from_secs(10),
        }
    }
}

/// A request to move to another state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeRequest {
    /// Target state.
    pub state: ConnectionState,
    /// Why the change happens.
    pub reason: Option<ErrorInfo>,
    /// Host to connect to instead of the primary.
    pub fallback_host: Option<String>,
    /// Host that was in effect when the request was made.
    pub current_host: Option<String>,
}

impl StateChangeRequest {
    /// Create a request with no reason.
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            reason: None,
            fallback_host: None,
            current_host: None,
        }
    }

    /// Set the reason.
    pub fn with_reason(mut self, reason: Option<ErrorInfo>) -> Self {
        self.reason = reason;
        self
    }

    /// Ask to connect to `fallback` after `current` failed.
    pub fn with_fallback(mut self, fallback: String, current: Option<String>) -> Self {
        self.fallback_host = Some(fallback);
        self.current_host = current;
        self
    }

    fn retarget(mut self, state: ConnectionState) -> Self {
        self.state = state;
        self
    }
}

/// Outcome of validating a request against the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Move to `request.state`, which may differ from what was asked.
    Transition(StateChangeRequest),
    /// Stay put, but tell listeners (`connected` → `connected`).
    Update(StateChangeRequest),
    /// Ignore the request.
    Reject,
}

/// Follow-up synthesized when a state's timer expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutTransition {
    /// Submit this request.
    Request(StateChangeRequest),
    /// Try a fallback host, else pick `suspended` or `disconnected`.
    CheckSuspend,
}

/// Side effect of entering a state, interpreted by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport.
    ConnectTransport,
    /// Close and forget the active transport.
    ReleaseTransport,
    /// Send a close message, or settle into `closed` if there is no transport.
    SendClose,
    /// Mark every channel connected.
    ChannelsConnected,
    /// Suspend every attaching or attached channel.
    SuspendChannels,
    /// Detach every channel with a "connection closed" reason.
    DetachChannels,
    /// Fail every channel with the triggering error.
    FailChannels,
    /// Send queued messages in FIFO order.
    FlushQueue,
    /// Fail every queued message.
    FailQueue,
    /// Fail every message awaiting acknowledgement.
    FailPending,
    /// Forget the connection identity, so the next connect is clean.
    ClearIdentity,
}

/// Connection events delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Entered `initialized`.
    Initialized,
    /// Entered `connecting`.
    Connecting,
    /// Entered `connected`.
    Connected,
    /// Entered `disconnected`.
    Disconnected,
    /// Entered `suspended`.
    Suspended,
    /// Entered `closing`.
    Closing,
    /// Entered `closed`.
    Closed,
    /// Entered `failed`.
    Failed,
    /// Connection parameters changed without a state change.
    Update,
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Initialized => Self::Initialized,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Disconnected => Self::Disconnected,
            ConnectionState::Suspended => Self::Suspended,
            ConnectionState::Closing => Self::Closing,
            ConnectionState::Closed => Self::Closed,
            ConnectionState::Failed => Self::Failed,
        }
    }
}

/// A state change as seen by listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChange {
    /// State before the change.
    pub previous: ConnectionState,
    /// State after the change.
    pub current: ConnectionState,
    /// What happened.
    pub event: ConnectionEvent,
    /// Why it happened.
    pub reason: Option<ErrorInfo>,
    /// When the state's timer fires, for states that retry.
    pub retry_in: Option<Duration>,
}

/// Descriptors for every state, built once from configured timeouts.
#[derive(Debug, Clone)]
pub struct StateTable {
    descriptors: [StateDescriptor; 8],
}

impl StateTable {
    /// Build the table.
    pub fn new(timeouts: StateTimeouts) -> Self {
        use ConnectionState::*;

        let descriptor = |state, queue_events, send_events, timeout, default_error| {
            StateDescriptor {
                state,
                queue_events,
                send_events,
                terminal: ConnectionState::is_terminal(state),
                timeout,
                default_error,
            }
        };

        Self {
            descriptors: [
                descriptor(Initialized, true, false, None, None),
                descriptor(Connecting, true, false, Some(timeouts.connect), None),
                descriptor(Connected, false, true, None, None),
                descriptor(
                    Disconnected,
                    true,
                    false,
                    Some(timeouts.disconnected_retry),
                    Some(ErrorInfo::disconnected()),
                ),
                descriptor(
                    Suspended,
                    false,
                    false,
                    Some(timeouts.suspended_retry),
                    Some(ErrorInfo::suspended()),
                ),
                descriptor(
                    Closing,
                    false,
                    false,
                    Some(timeouts.close),
                    Some(ErrorInfo::closed()),
                ),
                descriptor(Closed, false, false, None, Some(ErrorInfo::closed())),
                descriptor(Failed, false, false, None, Some(ErrorInfo::failed())),
            ],
        }
    }

    /// The descriptor for `state`.
    pub fn descriptor(&self, state: ConnectionState) -> &StateDescriptor {
        &self.descriptors[state.index()]
    }

    /// Effects of entering `state`, in the order they should run.
    pub fn enact(&self, state: ConnectionState) -> Vec<Effect> {
        use Effect::*;

        let mut effects = match state {
            ConnectionState::Initialized => vec![],
            ConnectionState::Connecting => vec![ConnectTransport],
            ConnectionState::Connected => vec![ChannelsConnected],
            // Channel state is preserved while a resume is still possible.
            ConnectionState::Disconnected => vec![ReleaseTransport],
            ConnectionState::Suspended => {
                vec![ReleaseTransport, SuspendChannels, FailPending, ClearIdentity]
            }
            ConnectionState::Closing => vec![SendClose],
            ConnectionState::Closed => {
                vec![ReleaseTransport, DetachChannels, FailPending, ClearIdentity]
            }
            ConnectionState::Failed => {
                vec![ReleaseTransport, FailChannels, FailPending, ClearIdentity]
            }
        };

        let descriptor = self.descriptor(state);
        if descriptor.send_events {
            effects.push(FlushQueue);
        } else if !descriptor.queue_events {
            effects.push(FailQueue);
        }
        effects
    }
}

impl Default for StateTable {
    fn default() -> Self {
        Self::new(StateTimeouts::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn request(state: ConnectionState) -> StateChangeRequest {
        StateChangeRequest::new(state)
    }

    fn target_of(verdict: Verdict) -> Option<ConnectionState> {
        match verdict {
            Verdict::Transition(r) => Some(r.state),
            Verdict::Update(_) | Verdict::Reject => None,
        }
    }

    // ===========================================
    // Validation Tests
    // ===========================================

    #[test]
    fn validation_is_pure() {
        for current in ConnectionState::ALL {
            for target in ConnectionState::ALL {
                let first = current.validate(request(target));
                let second = current.validate(request(target));
                assert_eq!(first, second, "{current} -> {target}");
            }
        }
    }

    #[test]
    fn initialized_accepts_everything_but_itself() {
        assert_eq!(Initialized.validate(request(Initialized)), Verdict::Reject);
        for target in ConnectionState::ALL.into_iter().filter(|s| *s != Initialized) {
            assert_eq!(target_of(Initialized.validate(request(target))), Some(target));
        }
    }

    #[test]
    fn connecting_accepts_everything() {
        for target in ConnectionState::ALL {
            assert_eq!(target_of(Connecting.validate(request(target))), Some(target));
        }
    }

    #[test]
    fn connected_to_connected_is_an_update() {
        let reason = ErrorInfo::new("token renewed", 0, 0);
        let verdict = Connected.validate(request(Connected).with_reason(Some(reason.clone())));

        match verdict {
            Verdict::Update(r) => assert_eq!(r.reason, Some(reason)),
            other => panic!("Expected Update, got {:?}", other),
        }
        assert_eq!(target_of(Connected.validate(request(Disconnected))), Some(Disconnected));
    }

    #[test]
    fn disconnected_and_suspended_reject_reentry() {
        assert_eq!(Disconnected.validate(request(Disconnected)), Verdict::Reject);
        assert_eq!(Suspended.validate(request(Suspended)), Verdict::Reject);
    }

    #[test]
    fn closing_without_transport_goes_straight_to_closed() {
        assert_eq!(target_of(Disconnected.validate(request(Closing))), Some(Closed));
        assert_eq!(target_of(Suspended.validate(request(Closing))), Some(Closed));
    }

    #[test]
    fn rewritten_request_keeps_its_reason() {
        let reason = ErrorInfo::disconnected();
        let verdict = Closing.validate(request(Disconnected).with_reason(Some(reason.clone())));

        match verdict {
            Verdict::Transition(r) => {
                assert_eq!(r.state, Closed);
                assert_eq!(r.reason, Some(reason));
            }
            other => panic!("Expected Transition, got {:?}", other),
        }
    }

    #[test]
    fn closing_rules() {
        assert_eq!(Closing.validate(request(Closing)), Verdict::Reject);
        assert_eq!(target_of(Closing.validate(request(Suspended))), Some(Closed));
        assert_eq!(target_of(Closing.validate(request(Closed))), Some(Closed));
        assert_eq!(target_of(Closing.validate(request(Failed))), Some(Failed));
    }

    #[test]
    fn terminal_states_only_accept_connecting() {
        for terminal in [Closed, Failed] {
            for target in ConnectionState::ALL {
                let verdict = terminal.validate(request(target));
                if target == Connecting {
                    assert_eq!(target_of(verdict), Some(Connecting));
                } else {
                    assert_eq!(verdict, Verdict::Reject, "{terminal} -> {target}");
                }
            }
        }
    }

    #[test]
    fn fallback_hint_survives_validation() {
        let req = request(Connecting).with_fallback("b.example.com".into(), Some("a".into()));
        match Connecting.validate(req) {
            Verdict::Transition(r) => {
                assert_eq!(r.fallback_host.as_deref(), Some("b.example.com"));
                assert_eq!(r.current_host.as_deref(), Some("a"));
            }
            other => panic!("Expected Transition, got {:?}", other),
        }
    }

    // ===========================================
    // Timeout Tests
    // ===========================================

    #[test]
    fn timeout_follow_ups() {
        assert_eq!(Connecting.on_timeout(), Some(TimeoutTransition::CheckSuspend));
        assert_eq!(
            Disconnected.on_timeout(),
            Some(TimeoutTransition::Request(request(Connecting)))
        );
        assert_eq!(
            Suspended.on_timeout(),
            Some(TimeoutTransition::Request(request(Connecting)))
        );
        assert_eq!(
            Closing.on_timeout(),
            Some(TimeoutTransition::Request(request(Closed)))
        );
        for state in [Initialized, Connected, Closed, Failed] {
            assert_eq!(state.on_timeout(), None);
        }
    }

    #[test]
    fn states_with_follow_ups_have_timers() {
        let table = StateTable::default();
        for state in ConnectionState::ALL {
            assert_eq!(
                state.on_timeout().is_some(),
                table.descriptor(state).timeout.is_some(),
                "{state}"
            );
        }
    }

    // ===========================================
    // Descriptor Tests
    // ===========================================

    #[test]
    fn descriptors_use_configured_timeouts() {
        let table = StateTable::new(StateTimeouts {
            connect: Duration::from_secs(1),
            disconnected_retry: Duration::from_secs(2),
            suspended_retry: Duration::from_secs(3),
            close: Duration::from_secs(4),
        });

        assert_eq!(table.descriptor(Connecting).timeout, Some(Duration::from_secs(1)));
        assert_eq!(table.descriptor(Disconnected).timeout, Some(Duration::from_secs(2)));
        assert_eq!(table.descriptor(Suspended).timeout, Some(Duration::from_secs(3)));
        assert_eq!(table.descriptor(Closing).timeout, Some(Duration::from_secs(4)));
    }

    #[test]
    fn only_connected_sends() {
        let table = StateTable::default();
        for state in ConnectionState::ALL {
            assert_eq!(table.descriptor(state).send_events, state == Connected);
        }
    }

    #[test]
    fn default_errors() {
        let table = StateTable::default();
        assert_eq!(table.descriptor(Disconnected).default_error.as_ref().unwrap().code, 80003);
        assert_eq!(table.descriptor(Suspended).default_error.as_ref().unwrap().code, 80002);
        assert_eq!(table.descriptor(Closed).default_error.as_ref().unwrap().code, 80017);
        assert_eq!(table.descriptor(Failed).default_error.as_ref().unwrap().code, 80000);
        assert!(table.descriptor(Connected).default_error.is_none());
        assert!(table.descriptor(Closed).terminal);
        assert!(!table.descriptor(Suspended).terminal);
    }

    // ===========================================
    // Enactment Tests
    // ===========================================

    #[test]
    fn entering_connected_flushes_the_queue() {
        let effects = StateTable::default().enact(Connected);
        assert_eq!(effects, vec![Effect::ChannelsConnected, Effect::FlushQueue]);
    }

    #[test]
    fn entering_disconnected_keeps_channels_and_queue() {
        let effects = StateTable::default().enact(Disconnected);
        assert_eq!(effects, vec![Effect::ReleaseTransport]);
    }

    #[test]
    fn states_that_stop_queueing_fail_the_queue() {
        let table = StateTable::default();
        for state in [Suspended, Closing, Closed, Failed] {
            assert!(table.enact(state).contains(&Effect::FailQueue), "{state}");
        }
        for state in [Initialized, Connecting, Disconnected] {
            assert!(!table.enact(state).contains(&Effect::FailQueue), "{state}");
        }
    }

    #[test]
    fn channel_effects_per_state() {
        let table = StateTable::default();
        assert!(table.enact(Suspended).contains(&Effect::SuspendChannels));
        assert!(table.enact(Closed).contains(&Effect::DetachChannels));
        assert!(table.enact(Failed).contains(&Effect::FailChannels));
        assert!(table.enact(Connecting).contains(&Effect::ConnectTransport));
        assert!(table.enact(Closing).contains(&Effect::SendClose));
    }

    #[test]
    fn event_mirrors_state() {
        assert_eq!(ConnectionEvent::from(Suspended), ConnectionEvent::Suspended);
        assert_eq!(Suspended.to_string(), "suspended");
    }
}
