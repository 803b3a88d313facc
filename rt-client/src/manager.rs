//! The connection manager.
//!
//! [`ConnectionManager`] owns the single logical connection to the service.
//! Callers talk to it from any task; transports report into it through
//! their [`TransportListener`](crate::transport::TransportListener). Every
//! state change is serialized through the action pipeline (see
//! [`pipeline`](crate::pipeline)), which interprets the pure state table
//! from `rtwire-core`.
//!
//! # Locking
//!
//! Two `parking_lot` mutexes, always taken in this order:
//! 1. `inner` - state, queue, transport, identity, timers
//! 2. `ledger` - messages awaiting acknowledgement
//!
//! Neither is ever held across an `.await`, and completion callbacks are
//! always invoked after both are released.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rtwire_core::{
    ConnectionEvent, ConnectionState, ConnectionStateChange, ErrorClassifier, Hosts,
    PendingLedger, StateChangeRequest, StateTable,
};
use rtwire_types::{
    codes, ConnectionIdentity, ErrorInfo, ProtocolAction, ProtocolMessage, RecoveryKey,
};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::Instant;

use crate::auth::{AuthProvider, NoAuth};
use crate::channels::{ChannelRegistry, NoChannels};
use crate::config::ConnectionOptions;
use crate::connectivity::{ConnectivityCheck, HttpConnectivityCheck};
use crate::error::ClientError;
use crate::pipeline::{Action, Committed};
use crate::transport::{Transport, TransportFactory};

/// Capacity of the state change broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Called once with the outcome of a send or ping.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), ErrorInfo>) + Send + 'static>;

/// The pluggable parts of a manager.
pub struct Collaborators {
    transports: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthProvider>,
    channels: Arc<dyn ChannelRegistry>,
    connectivity: Option<Arc<dyn ConnectivityCheck>>,
}

impl Collaborators {
    /// Use `transports`, with no auth, no channels and the HTTP connectivity
    /// probe from the options.
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            transports,
            auth: Arc::new(NoAuth),
            channels: Arc::new(NoChannels),
            connectivity: None,
        }
    }

    /// Set the auth provider.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Set the channel registry.
    pub fn with_channels(mut self, channels: Arc<dyn ChannelRegistry>) -> Self {
        self.channels = channels;
        self
    }

    /// Replace the connectivity probe.
    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }
}

pub(crate) struct QueuedMessage {
    pub(crate) message: ProtocolMessage,
    pub(crate) callback: Option<CompletionCallback>,
}

pub(crate) struct ActiveTransport {
    pub(crate) id: u64,
    pub(crate) handle: Arc<dyn Transport>,
    pub(crate) host: String,
}

/// A send that the transport refused, with the callback still owed.
pub(crate) struct SendFailure {
    pub(crate) error: ErrorInfo,
    pub(crate) callback: Option<CompletionCallback>,
}

pub(crate) struct Inner {
    pub(crate) state: ConnectionState,
    pub(crate) error: Option<ErrorInfo>,
    /// Deferred work for the worker.
    pub(crate) actions: VecDeque<Action>,
    /// Committed transitions whose effects have not run yet. Drained before
    /// `actions`, in commit order.
    pub(crate) enactments: VecDeque<Committed>,
    pub(crate) worker_running: bool,
    pub(crate) shutdown: bool,
    /// When the current state's timer fires.
    pub(crate) deadline: Option<Instant>,
    pub(crate) transport: Option<ActiveTransport>,
    pub(crate) next_transport_id: u64,
    /// Host of the attempt in flight, until `connected` or a failure.
    pub(crate) pending_connect: Option<String>,
    pub(crate) identity: Option<ConnectionIdentity>,
    pub(crate) recover: Option<RecoveryKey>,
    pub(crate) hosts: Hosts,
    /// Past this, a lost connection goes to `suspended`.
    pub(crate) suspend_deadline: Option<Instant>,
    pub(crate) queue: VecDeque<QueuedMessage>,
    pub(crate) last_activity: Instant,
}

impl Inner {
    pub(crate) fn is_active(&self, transport_id: u64) -> bool {
        self.transport.as_ref().is_some_and(|t| t.id == transport_id)
    }

    fn has_pending_connect_request(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, Action::Request(r) if r.state == ConnectionState::Connecting))
    }
}

pub(crate) struct Shared {
    pub(crate) options: ConnectionOptions,
    pub(crate) states: StateTable,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) ledger: Mutex<PendingLedger<Option<CompletionCallback>>>,
    pub(crate) wake: Notify,
    pub(crate) events: broadcast::Sender<ConnectionStateChange>,
    pub(crate) heartbeats: Mutex<Vec<oneshot::Sender<()>>>,
    pub(crate) transports: Arc<dyn TransportFactory>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) channels: Arc<dyn ChannelRegistry>,
    pub(crate) connectivity: Arc<dyn ConnectivityCheck>,
    pub(crate) runtime: Handle,
}

/// Invoke a completion callback, containing any panic.
pub(crate) fn complete(callback: Option<CompletionCallback>, result: Result<(), ErrorInfo>) {
    if let Some(callback) = callback {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
            tracing::warn!("completion callback panicked");
        }
    }
}

fn queue_full() -> ErrorInfo {
    ErrorInfo::new("Outbound queue full", codes::INTERNAL, 500)
}

fn not_connected() -> ErrorInfo {
    ErrorInfo::new(
        "Unable to ping service; not connected",
        codes::BAD_REQUEST,
        400,
    )
}

fn superseded() -> ErrorInfo {
    ErrorInfo::new(
        "Message superseded before acknowledgement",
        codes::INTERNAL,
        500,
    )
}

fn rejected() -> ErrorInfo {
    ErrorInfo::new("Message rejected by server", codes::INTERNAL, 500)
}

/// How a `connected` message relates to what we had before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuity {
    /// Already connected; the server refreshed the connection.
    Update,
    /// Same connection as before the drop.
    Resumed,
    /// Recovered the connection named by the recovery key.
    Recovered(u64),
    /// A different connection than the one we tried to continue.
    ResumeFailed,
    /// Nothing to continue.
    Fresh,
}

// ===========================================
// Shared: outbound path
// ===========================================

impl Shared {
    pub(crate) fn classifier(&self) -> &ErrorClassifier {
        &self.options.errors
    }

    /// `suspended` once the suspend deadline has passed, else `disconnected`.
    pub(crate) fn suspend_target(&self, inner: &Inner) -> ConnectionState {
        match inner.suspend_deadline {
            Some(deadline) if Instant::now() >= deadline => ConnectionState::Suspended,
            _ => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn start_suspend_timer(&self, inner: &mut Inner, ttl: Duration) {
        inner.suspend_deadline = Some(Instant::now() + ttl);
    }

    /// Hand a message to `transport`, recording it in the ledger when it needs
    /// an acknowledgement.
    ///
    /// Returns the callback to complete now when the message was not
    /// ledgered.
    pub(crate) fn send_via(
        &self,
        transport: &dyn Transport,
        mut message: ProtocolMessage,
        callback: Option<CompletionCallback>,
    ) -> Result<Option<CompletionCallback>, SendFailure> {
        if !message.action.ack_required() {
            return match transport.send(message) {
                Ok(()) => Ok(callback),
                Err(e) => Err(SendFailure {
                    error: e.to_error_info(),
                    callback,
                }),
            };
        }

        let mut ledger = self.ledger.lock();
        let serial = ledger.next_serial();
        message.msg_serial = Some(serial);
        if let Err(e) = transport.send(message) {
            return Err(SendFailure {
                error: e.to_error_info(),
                callback,
            });
        }
        if let Err(e) = ledger.push(serial, callback) {
            tracing::error!(error = %e, "ledger refused a sent message");
        }
        Ok(None)
    }

    pub(crate) fn send_auth(&self, token: &str) -> Result<(), ErrorInfo> {
        let inner = self.inner.lock();
        match (inner.state, inner.transport.as_ref()) {
            (ConnectionState::Connected, Some(active)) => active
                .handle
                .send(ProtocolMessage::auth(token))
                .map_err(|e| e.to_error_info()),
            _ => Err(inner.error.clone().unwrap_or_else(ErrorInfo::disconnected)),
        }
    }

    pub(crate) fn close_in_background(&self, active: ActiveTransport) {
        self.runtime.spawn(async move {
            tracing::debug!(host = %active.host, "closing transport");
            active.handle.close().await;
        });
    }
}

// ===========================================
// Shared: inbound path
// ===========================================

impl Shared {
    /// Route a message from transport `transport_id`.
    pub(crate) fn on_protocol_message(self: &Arc<Self>, transport_id: u64, message: ProtocolMessage) {
        {
            let mut inner = self.inner.lock();
            if !inner.is_active(transport_id) {
                tracing::debug!(
                    transport_id,
                    action = ?message.action,
                    "ignoring message from superseded transport"
                );
                return;
            }
            inner.last_activity = Instant::now();
        }

        match message.action {
            ProtocolAction::Connected => self.submit(Action::Connected {
                transport_id,
                message,
            }),
            ProtocolAction::Disconnected => self.on_server_disconnect(transport_id, message.error),
            ProtocolAction::Error if message.channel.is_none() => {
                self.on_server_disconnect(transport_id, message.error)
            }
            ProtocolAction::Closed => match message.error {
                Some(error) => self.on_server_disconnect(transport_id, Some(error)),
                None => self.on_server_closed(transport_id),
            },
            ProtocolAction::Ack => self.on_ack(&message),
            ProtocolAction::Nack => self.on_nack(&message),
            ProtocolAction::Heartbeat => self.on_heartbeat(),
            ProtocolAction::Auth => self.on_auth_requested(),
            _ => self.channels.on_channel_message(message),
        }
    }

    /// The server dropped or refused the connection.
    fn on_server_disconnect(self: &Arc<Self>, transport_id: u64, reason: Option<ErrorInfo>) {
        let fatal = self.classifier().is_fatal(reason.as_ref());
        let target = if fatal {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        };

        let released = {
            let mut inner = self.inner.lock();
            if !inner.is_active(transport_id) {
                return;
            }
            let released = inner.transport.take();
            inner.pending_connect = None;
            self.commit_now(
                &mut inner,
                StateChangeRequest::new(target).with_reason(reason.clone()),
            );
            released
        };

        self.notify_token_error(reason.as_ref());
        if let Some(active) = released {
            self.close_in_background(active);
        }
    }

    fn on_server_closed(self: &Arc<Self>, transport_id: u64) {
        let mut inner = self.inner.lock();
        if !inner.is_active(transport_id) {
            return;
        }
        inner.identity = None;
        self.enqueue(
            &mut inner,
            Action::Request(StateChangeRequest::new(ConnectionState::Closed)),
        );
    }

    /// Transport `transport_id` failed or went away.
    pub(crate) fn on_transport_failure(self: &Arc<Self>, transport_id: u64, reason: Option<ErrorInfo>) {
        let fatal = self.classifier().is_fatal(reason.as_ref());
        let fallback_eligible = reason.as_ref().map_or(true, ErrorInfo::is_server_error);

        let released = {
            let mut inner = self.inner.lock();
            if !inner.is_active(transport_id) {
                tracing::debug!(transport_id, ?reason, "ignoring failure of superseded transport");
                return;
            }
            let released = inner.transport.take();
            tracing::info!(
                transport_id,
                state = %inner.state,
                reason = ?reason,
                "transport unavailable"
            );

            if !fatal
                && fallback_eligible
                && inner.state == ConnectionState::Connecting
                && inner.pending_connect.is_some()
                && inner.hosts.has_fallback()
            {
                self.enqueue(
                    &mut inner,
                    Action::CheckSuspend {
                        reason: reason.clone(),
                    },
                );
            } else {
                inner.pending_connect = None;
                let target = if fatal {
                    ConnectionState::Failed
                } else {
                    self.suspend_target(&inner)
                };
                self.commit_now(
                    &mut inner,
                    StateChangeRequest::new(target).with_reason(reason.clone()),
                );
            }
            released
        };

        self.notify_token_error(reason.as_ref());
        if let Some(active) = released {
            self.close_in_background(active);
        }
    }

    pub(crate) fn on_transport_available(&self, transport_id: u64) {
        let mut inner = self.inner.lock();
        match inner.transport.as_ref() {
            Some(active) if active.id == transport_id => {
                tracing::debug!(host = %active.host, "transport available");
                inner.last_activity = Instant::now();
            }
            _ => tracing::debug!(transport_id, "ignoring availability of superseded transport"),
        }
    }

    /// The server confirmed a connection on `transport_id`.
    pub(crate) async fn on_connected(self: &Arc<Self>, transport_id: u64, message: ProtocolMessage) {
        let Some(identity) = ConnectionIdentity::from_connected(&message) else {
            tracing::warn!("connected message without a connection id");
            return;
        };
        let ttl = identity
            .connection_state_ttl
            .unwrap_or_else(|| self.options.timeouts.connection_state_ttl());
        let max_idle = identity.max_idle_interval;

        let (continuity, failed, committed) = {
            let mut inner = self.inner.lock();
            if !inner.is_active(transport_id) {
                tracing::debug!(transport_id, "ignoring connected from superseded transport");
                return;
            }

            let continuity = if inner.state == ConnectionState::Connected {
                Continuity::Update
            } else {
                match (&inner.identity, &inner.recover) {
                    (Some(prior), _) if prior.id == identity.id => Continuity::Resumed,
                    (Some(_), _) => Continuity::ResumeFailed,
                    (None, Some(key)) if key.connection_id == identity.id => {
                        Continuity::Recovered(key.msg_serial)
                    }
                    (None, Some(_)) => Continuity::ResumeFailed,
                    (None, None) => Continuity::Fresh,
                }
            };

            tracing::info!(
                connection_id = %identity.id,
                continuity = ?continuity,
                "connection established"
            );
            inner.recover = None;
            inner.pending_connect = None;
            inner.hosts.reset();
            inner.last_activity = Instant::now();
            inner.identity = Some(identity);
            self.start_suspend_timer(&mut inner, ttl);

            let failed = match continuity {
                Continuity::Fresh | Continuity::ResumeFailed => {
                    let mut ledger = self.ledger.lock();
                    let up_to = ledger.next_serial();
                    ledger.reset(up_to)
                }
                Continuity::Recovered(serial) => self.ledger.lock().continue_from(serial),
                Continuity::Update | Continuity::Resumed => Vec::new(),
            };

            let committed = self.commit(
                &mut inner,
                StateChangeRequest::new(ConnectionState::Connected)
                    .with_reason(message.error.clone()),
            );
            (continuity, failed, committed)
        };

        let resume_error = message.error.clone().unwrap_or_else(ErrorInfo::resume_failed);
        for callback in failed {
            complete(callback, Err(resume_error.clone()));
        }
        match continuity {
            Continuity::Resumed => {
                tracing::debug!(channels = ?self.channels.channel_names(), "reattaching channels");
                self.channels.reattach(message.error.as_ref());
            }
            Continuity::ResumeFailed => {
                tracing::debug!(channels = ?self.channels.channel_names(), "continuity lost");
                self.channels.set_suspended(&resume_error, true);
            }
            Continuity::Update | Continuity::Recovered(_) | Continuity::Fresh => {}
        }

        if let Some(committed) = committed {
            let is_transition = !committed.update;
            self.enact(committed).await;
            if is_transition {
                if let Some(max_idle) = max_idle {
                    self.watch_activity(transport_id, max_idle);
                }
            }
        }
    }

    fn on_ack(&self, message: &ProtocolMessage) {
        let Some(serial) = message.msg_serial else {
            tracing::warn!("ack without a serial");
            return;
        };
        let count = message.count.unwrap_or(1);
        let resolution = self.ledger.lock().ack(serial, count);
        if resolution.is_empty() {
            tracing::debug!(serial, count, "ack matched nothing pending");
            return;
        }
        tracing::debug!(
            serial,
            acked = resolution.acked.len(),
            nacked = resolution.nacked.len(),
            "pending messages resolved"
        );

        let skipped = message.error.clone().unwrap_or_else(superseded);
        for callback in resolution.nacked {
            complete(callback, Err(skipped.clone()));
        }
        for callback in resolution.acked {
            complete(callback, Ok(()));
        }
    }

    fn on_nack(&self, message: &ProtocolMessage) {
        let Some(serial) = message.msg_serial else {
            tracing::warn!("nack without a serial");
            return;
        };
        let count = message.count.unwrap_or(1);
        let failed = self.ledger.lock().nack(serial, count);
        tracing::debug!(serial, nacked = failed.len(), "pending messages rejected");

        let reason = message.error.clone().unwrap_or_else(rejected);
        for callback in failed {
            complete(callback, Err(reason.clone()));
        }
    }

    fn on_heartbeat(&self) {
        let waiters = std::mem::take(&mut *self.heartbeats.lock());
        for waiter in waiters {
            // The pinger may have timed out already.
            let _ = waiter.send(());
        }
    }

    /// The server asked for fresh credentials.
    fn on_auth_requested(self: &Arc<Self>) {
        let shared = Arc::downgrade(self);
        let auth = Arc::clone(&self.auth);
        self.runtime.spawn(async move {
            let renewed = auth.renew().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let reason = match renewed {
                Ok(token) => match shared.send_auth(&token) {
                    Ok(()) => None,
                    Err(e) => Some(e),
                },
                Err(e) => Some(e),
            };
            if let Some(error) = &reason {
                tracing::warn!(%error, "reauthorisation failed");
            }

            let connected = shared.inner.lock().state == ConnectionState::Connected;
            if connected {
                shared.emit(
                    ConnectionState::Connected,
                    ConnectionState::Connected,
                    ConnectionEvent::Update,
                    reason,
                );
            }
        });
    }

    fn notify_token_error(&self, reason: Option<&ErrorInfo>) {
        if let Some(error) = reason {
            if self.classifier().is_token_error(error) {
                self.auth.on_auth_error(error);
            }
        }
    }

    /// Treat the transport as failed if the server stays silent too long.
    fn watch_activity(self: &Arc<Self>, transport_id: u64, max_idle: Duration) {
        let limit = max_idle + self.options.timeouts.realtime_request();
        let shared = Arc::downgrade(self);
        self.runtime.spawn(async move {
            loop {
                let deadline = {
                    let Some(strong) = shared.upgrade() else {
                        return;
                    };
                    let inner = strong.inner.lock();
                    if !inner.is_active(transport_id) {
                        return;
                    }
                    inner.last_activity + limit
                };
                tokio::time::sleep_until(deadline).await;

                let Some(strong) = shared.upgrade() else {
                    return;
                };
                let silent = {
                    let inner = strong.inner.lock();
                    if !inner.is_active(transport_id) {
                        return;
                    }
                    inner.last_activity.elapsed()
                };
                if silent >= limit {
                    tracing::warn!(silent_ms = silent.as_millis(), "no activity from server");
                    strong.on_transport_failure(
                        transport_id,
                        Some(ErrorInfo::idle_timeout(silent.as_millis())),
                    );
                    return;
                }
            }
        });
    }
}

// ===========================================
// ConnectionManager
// ===========================================

/// Owns one logical connection to the service.
///
/// Must be created inside a Tokio runtime. Dropping the manager stops its
/// worker and closes the active transport.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager in the `initialized` state. Nothing connects until
    /// [`connect`](Self::connect) is called.
    pub fn new(options: ConnectionOptions, collaborators: Collaborators) -> Result<Self, ClientError> {
        let runtime = Handle::try_current()?;
        let recover = options
            .recover
            .as_deref()
            .map(RecoveryKey::decode)
            .transpose()?;
        let connectivity: Arc<dyn ConnectivityCheck> = match collaborators.connectivity {
            Some(connectivity) => connectivity,
            None => Arc::new(HttpConnectivityCheck::new(
                &options.endpoint.connectivity_check_url,
                options.timeouts.realtime_request(),
            )?),
        };
        let hosts = Hosts::new(
            options.endpoint.host.clone(),
            options.endpoint.fallback_hosts.clone(),
        );
        let states = StateTable::new(options.timeouts.state_timeouts());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Inner {
            state: ConnectionState::Initialized,
            error: None,
            actions: VecDeque::new(),
            enactments: VecDeque::new(),
            worker_running: false,
            shutdown: false,
            deadline: None,
            transport: None,
            next_transport_id: 0,
            pending_connect: None,
            identity: None,
            recover,
            hosts,
            suspend_deadline: None,
            queue: VecDeque::new(),
            last_activity: Instant::now(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                options,
                states,
                inner: Mutex::new(inner),
                ledger: Mutex::new(PendingLedger::new()),
                wake: Notify::new(),
                events,
                heartbeats: Mutex::new(Vec::new()),
                transports: collaborators.transports,
                auth: collaborators.auth,
                channels: collaborators.channels,
                connectivity,
                runtime,
            }),
        })
    }

    /// Start connecting. A no-op while already connecting or connected.
    pub fn connect(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::debug!(state = %inner.state, "connect ignored");
                return;
            }
            ConnectionState::Initialized | ConnectionState::Closed | ConnectionState::Failed => {
                let ttl = shared.options.timeouts.connection_state_ttl();
                shared.start_suspend_timer(&mut inner, ttl);
            }
            _ => {}
        }
        if inner.has_pending_connect_request() {
            return;
        }
        shared.enqueue(
            &mut inner,
            Action::Request(StateChangeRequest::new(ConnectionState::Connecting)),
        );
    }

    /// Ask the server to close the connection.
    pub fn close(&self) {
        self.shared.request(StateChangeRequest::new(ConnectionState::Closing));
    }

    /// Close and wait until the connection is `closed` (or `failed`).
    pub async fn close_and_wait(&self) -> Result<(), ErrorInfo> {
        let mut events = self.subscribe();
        if let Some(settled) = self.settled() {
            return settled;
        }
        self.close();

        loop {
            match events.recv().await {
                Ok(change) => match change.current {
                    ConnectionState::Closed => return Ok(()),
                    ConnectionState::Failed => {
                        return Err(change.reason.unwrap_or_else(ErrorInfo::failed))
                    }
                    _ => continue,
                },
                Err(RecvError::Lagged(_)) => {
                    if let Some(settled) = self.settled() {
                        return settled;
                    }
                }
                Err(RecvError::Closed) => return Err(ErrorInfo::closed()),
            }
        }
    }

    fn settled(&self) -> Option<Result<(), ErrorInfo>> {
        match self.state() {
            ConnectionState::Closed => Some(Ok(())),
            ConnectionState::Failed => {
                Some(Err(self.error_reason().unwrap_or_else(ErrorInfo::failed)))
            }
            _ => None,
        }
    }

    /// Send a message.
    ///
    /// Connected: the message goes to the transport now. Otherwise it is
    /// queued when `queue_events` is set and the state allows queueing. An
    /// error means the message was neither sent nor queued, and `callback`
    /// is dropped uncalled.
    ///
    /// `callback` fires once: on ack or nack for messages that need one,
    /// right after the transport accepted them otherwise.
    pub fn send(
        &self,
        message: ProtocolMessage,
        queue_events: bool,
        callback: Option<CompletionCallback>,
    ) -> Result<(), ErrorInfo> {
        let shared = &self.shared;
        let completed = {
            let mut inner = shared.inner.lock();
            let descriptor = shared.states.descriptor(inner.state);

            if descriptor.send_events {
                let Some(transport) = inner.transport.as_ref().map(|t| Arc::clone(&t.handle))
                else {
                    return Err(inner.error.clone().unwrap_or_else(ErrorInfo::disconnected));
                };
                shared
                    .send_via(transport.as_ref(), message, callback)
                    .map_err(|failure| failure.error)?
            } else if queue_events && descriptor.queue_events && shared.options.queue.queue_messages
            {
                if inner.queue.len() >= shared.options.queue.max_queued_messages {
                    return Err(queue_full());
                }
                inner.queue.push_back(QueuedMessage { message, callback });
                None
            } else {
                let state = inner.state;
                return Err(inner
                    .error
                    .clone()
                    .or_else(|| descriptor.default_error.clone())
                    .unwrap_or_else(|| {
                        ErrorInfo::new(
                            format!("Unable to send message; connection {state}"),
                            codes::CONNECTION_FAILED,
                            400,
                        )
                    }));
            }
        };
        complete(completed, Ok(()));
        Ok(())
    }

    /// [`send`](Self::send), waiting for the outcome.
    pub async fn send_and_wait(
        &self,
        message: ProtocolMessage,
        queue_events: bool,
    ) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(
            message,
            queue_events,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        rx.await.unwrap_or_else(|_| {
            Err(ErrorInfo::new(
                "Connection dropped before completion",
                codes::INTERNAL,
                500,
            ))
        })
    }

    /// Send a heartbeat and call back when the server answers, or with a
    /// timeout error after the realtime request timeout.
    pub fn ping(&self, callback: CompletionCallback) {
        let shared = &self.shared;
        let (tx, rx) = oneshot::channel();
        let sent = {
            let inner = shared.inner.lock();
            match (inner.state, inner.transport.as_ref()) {
                (ConnectionState::Connected, Some(active)) => {
                    shared.heartbeats.lock().push(tx);
                    active
                        .handle
                        .send(ProtocolMessage::heartbeat())
                        .map_err(|e| e.to_error_info())
                }
                _ => Err(not_connected()),
            }
        };
        if let Err(error) = sent {
            complete(Some(callback), Err(error));
            return;
        }

        let timeout = shared.options.timeouts.realtime_request();
        let weak = Arc::downgrade(shared);
        shared.runtime.spawn(async move {
            let result = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(())) => Ok(()),
                _ => {
                    // Our receiver is gone; drop every waiter nobody listens to.
                    if let Some(shared) = weak.upgrade() {
                        shared.heartbeats.lock().retain(|tx| !tx.is_closed());
                    }
                    Err(ErrorInfo::heartbeat_timeout())
                }
            };
            complete(Some(callback), result);
        });
    }

    /// [`ping`](Self::ping), waiting for the outcome.
    pub async fn ping_and_wait(&self) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.ping(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.await.unwrap_or_else(|_| Err(ErrorInfo::heartbeat_timeout()))
    }

    /// New credentials are available.
    ///
    /// Connected: send them in-band, and with `wait_for_response` wait for
    /// the server to confirm. Connecting: restart the attempt so it picks
    /// them up from the auth provider. Otherwise: connect.
    pub async fn on_auth_updated(
        &self,
        token: &str,
        wait_for_response: bool,
    ) -> Result<(), ErrorInfo> {
        let mut events = self.subscribe();
        match self.state() {
            ConnectionState::Connected => self.shared.send_auth(token)?,
            ConnectionState::Connecting => {
                tracing::info!("restarting connection attempt with new credentials");
                self.shared
                    .request(StateChangeRequest::new(ConnectionState::Connecting));
            }
            _ => self.connect(),
        }
        if !wait_for_response {
            return Ok(());
        }

        loop {
            match events.recv().await {
                Ok(change) => match change.event {
                    ConnectionEvent::Connected | ConnectionEvent::Update => {
                        return match change.reason {
                            Some(reason) if change.event == ConnectionEvent::Update => Err(reason),
                            _ => Ok(()),
                        }
                    }
                    ConnectionEvent::Disconnected
                    | ConnectionEvent::Suspended
                    | ConnectionEvent::Closed
                    | ConnectionEvent::Failed => {
                        return Err(change
                            .reason
                            .unwrap_or_else(ErrorInfo::disconnected))
                    }
                    _ => continue,
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(ErrorInfo::closed()),
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Reason for the current state, if any.
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.inner.lock().error.clone()
    }

    /// Identity of the current connection.
    pub fn identity(&self) -> Option<ConnectionIdentity> {
        self.shared.inner.lock().identity.clone()
    }

    /// Host of the active transport.
    pub fn host(&self) -> Option<String> {
        self.shared
            .inner
            .lock()
            .transport
            .as_ref()
            .map(|t| t.host.clone())
    }

    /// Number of messages waiting for a connection.
    pub fn queued_messages(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Number of sent messages waiting for an acknowledgement.
    pub fn pending_messages(&self) -> usize {
        self.shared.ledger.lock().len()
    }

    /// Key that lets another process recover this connection, if there is
    /// one to recover.
    pub fn recovery_key(&self) -> Result<Option<String>, ClientError> {
        let key = {
            let inner = self.shared.inner.lock();
            match inner.identity.as_ref() {
                Some(ConnectionIdentity {
                    id,
                    key: Some(connection_key),
                    ..
                }) => Some(RecoveryKey {
                    connection_key: connection_key.clone(),
                    connection_id: id.clone(),
                    msg_serial: self.shared.ledger.lock().next_serial(),
                }),
                _ => None,
            }
        };
        Ok(key.map(|k| k.encode()).transpose()?)
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.shared.events.subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let released = {
            let mut inner = self.shared.inner.lock();
            inner.shutdown = true;
            inner.transport.take()
        };
        self.shared.wake.notify_one();
        if let Some(active) = released {
            self.shared.close_in_background(active);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &inner.state)
            .field("connection_id", &inner.identity.as_ref().map(|i| &i.id))
            .field("queued", &inner.queue.len())
            .finish()
    }
}
