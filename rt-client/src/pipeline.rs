//! Action pipeline.
//!
//! One worker task per manager runs every state change in order. Work
//! arrives two ways:
//!
//! - **deferred**: an [`Action`] is queued and the worker validates and
//!   commits it when it gets there (`connect()`, `close()`, timer follow-ups)
//! - **synchronous**: the caller commits under the manager lock right away
//!   and queues only the side effects (transport failures, server
//!   disconnects), so a `send()` racing a failure sees the new state
//!
//! Both go through [`Shared::commit`]. Committed-but-unenacted transitions
//! are kept in their own FIFO that the worker drains before taking the
//! next action, so effects and events always follow commit order.
//!
//! The worker sleeps on a single [`Notify`](tokio::sync::Notify) bounded by
//! the current state's deadline, and exits once the connection is terminal
//! and there is nothing left to do. Any later submission starts a new one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use rtwire_core::{
    ConnectionEvent, ConnectionState, ConnectionStateChange, Effect, StateChangeRequest,
    TimeoutTransition, Verdict,
};
use rtwire_types::{ErrorInfo, ProtocolMessage};
use tokio::time::Instant;

use crate::manager::{complete, ActiveTransport, Inner, QueuedMessage, Shared};
use crate::transport::{ConnectMode, TransportListener, TransportParams};

/// Deferred work for the worker.
pub(crate) enum Action {
    /// Validate and commit a state change.
    Request(StateChangeRequest),
    /// A transport reported itself available.
    TransportAvailable { transport_id: u64 },
    /// The server confirmed a connection.
    Connected {
        transport_id: u64,
        message: ProtocolMessage,
    },
    /// The attempt in flight failed; try a fallback host or give up.
    CheckSuspend { reason: Option<ErrorInfo> },
}

/// A validated state change whose side effects are still to run.
pub(crate) struct Committed {
    pub(crate) previous: ConnectionState,
    pub(crate) request: StateChangeRequest,
    pub(crate) reason: Option<ErrorInfo>,
    /// `connected` → `connected`: notify only.
    pub(crate) update: bool,
}

enum Step {
    Enact(Committed),
    Run(Action),
    Wait(Option<Instant>),
}

// ===========================================
// Submission and commit
// ===========================================

impl Shared {
    /// Queue `action`, starting the worker if needed.
    pub(crate) fn enqueue(self: &Arc<Self>, inner: &mut Inner, action: Action) {
        inner.actions.push_back(action);
        self.ensure_worker(inner);
        self.wake.notify_one();
    }

    /// Queue `action` for the worker.
    pub(crate) fn submit(self: &Arc<Self>, action: Action) {
        let mut inner = self.inner.lock();
        self.enqueue(&mut inner, action);
    }

    /// Queue a deferred state change.
    pub(crate) fn request(self: &Arc<Self>, request: StateChangeRequest) {
        self.submit(Action::Request(request));
    }

    /// Validate `request` against the live state and apply it.
    ///
    /// Returns `None` when the request is rejected.
    pub(crate) fn commit(&self, inner: &mut Inner, request: StateChangeRequest) -> Option<Committed> {
        let current = inner.state;
        let target = request.state;

        match current.validate(request) {
            Verdict::Reject => {
                tracing::debug!(%current, %target, "state change rejected");
                None
            }
            Verdict::Update(request) => {
                tracing::debug!(%current, reason = ?request.reason, "connection updated");
                Some(Committed {
                    previous: current,
                    reason: request.reason.clone(),
                    request,
                    update: true,
                })
            }
            Verdict::Transition(request) => {
                let descriptor = self.states.descriptor(request.state);
                let reason = request
                    .reason
                    .clone()
                    .or_else(|| descriptor.default_error.clone());

                inner.state = request.state;
                inner.error = reason.clone();
                // An attempt in flight belongs to `connecting` only.
                if request.state != ConnectionState::Connecting {
                    inner.pending_connect = None;
                }
                inner.deadline = descriptor.timeout.map(|timeout| Instant::now() + timeout);

                tracing::info!(
                    previous = %current,
                    current = %request.state,
                    reason = ?reason,
                    "connection state changed"
                );
                Some(Committed {
                    previous: current,
                    request,
                    reason,
                    update: false,
                })
            }
        }
    }

    /// Commit now, leaving the side effects to the worker.
    pub(crate) fn commit_now(self: &Arc<Self>, inner: &mut Inner, request: StateChangeRequest) {
        if let Some(committed) = self.commit(inner, request) {
            inner.enactments.push_back(committed);
            self.ensure_worker(inner);
            self.wake.notify_one();
        }
    }

    fn ensure_worker(self: &Arc<Self>, inner: &mut Inner) {
        if inner.worker_running || inner.shutdown {
            return;
        }
        inner.worker_running = true;
        let shared = Arc::clone(self);
        self.runtime.spawn(shared.run_worker());
    }
}

// ===========================================
// Worker
// ===========================================

impl Shared {
    async fn run_worker(self: Arc<Self>) {
        tracing::debug!("connection worker started");
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if inner.shutdown {
                    inner.worker_running = false;
                    break;
                }
                if let Some(committed) = inner.enactments.pop_front() {
                    Step::Enact(committed)
                } else if let Some(action) = inner.actions.pop_front() {
                    Step::Run(action)
                } else if inner.state.is_terminal() {
                    inner.worker_running = false;
                    break;
                } else {
                    Step::Wait(inner.deadline)
                }
            };

            match step {
                Step::Enact(committed) => self.guarded(self.enact(committed)).await,
                Step::Run(action) => self.guarded(self.run(action)).await,
                Step::Wait(None) => self.wake.notified().await,
                Step::Wait(Some(deadline)) => {
                    let woken = tokio::time::timeout_at(deadline, self.wake.notified()).await;
                    if woken.is_err() {
                        self.on_state_timeout(deadline);
                    }
                }
            }
        }
        tracing::debug!("connection worker stopped");
    }

    /// Run one unit of work, containing panics so the worker survives.
    async fn guarded(&self, work: impl std::future::Future<Output = ()>) {
        if AssertUnwindSafe(work).catch_unwind().await.is_err() {
            tracing::error!("connection action panicked");
        }
    }

    async fn run(self: &Arc<Self>, action: Action) {
        match action {
            Action::Request(request) => {
                let committed = {
                    let mut inner = self.inner.lock();
                    self.commit(&mut inner, request)
                };
                if let Some(committed) = committed {
                    self.enact(committed).await;
                }
            }
            Action::TransportAvailable { transport_id } => {
                self.on_transport_available(transport_id)
            }
            Action::Connected {
                transport_id,
                message,
            } => self.on_connected(transport_id, message).await,
            Action::CheckSuspend { reason } => self.check_suspend(reason).await,
        }
    }

    /// The current state's timer fired with nothing else to do.
    fn on_state_timeout(self: &Arc<Self>, deadline: Instant) {
        let released = {
            let mut inner = self.inner.lock();
            if inner.deadline != Some(deadline)
                || !inner.actions.is_empty()
                || !inner.enactments.is_empty()
            {
                return;
            }
            inner.deadline = None;

            match inner.state.on_timeout() {
                Some(TimeoutTransition::Request(request)) => {
                    tracing::debug!(state = %inner.state, next = %request.state, "state timer fired");
                    self.enqueue(&mut inner, Action::Request(request));
                    None
                }
                Some(TimeoutTransition::CheckSuspend) => {
                    tracing::info!("connection attempt timed out");
                    let released = inner.transport.take();
                    self.enqueue(&mut inner, Action::CheckSuspend { reason: None });
                    released
                }
                None => None,
            }
        };
        if let Some(active) = released {
            self.close_in_background(active);
        }
    }

    /// Decide what follows a failed attempt: a fallback host while the
    /// network is up and hosts remain, else `suspended` or `disconnected`.
    async fn check_suspend(self: &Arc<Self>, reason: Option<ErrorInfo>) {
        let candidate = {
            let inner = self.inner.lock();
            let eligible = reason.as_ref().map_or(true, ErrorInfo::is_server_error);
            inner.state == ConnectionState::Connecting
                && inner.pending_connect.is_some()
                && inner.hosts.has_fallback()
                && eligible
        };

        if candidate && self.connectivity.is_online().await {
            let committed = {
                let mut inner = self.inner.lock();
                let current = inner.pending_connect.clone();
                let next = match (&current, inner.state) {
                    (Some(current), ConnectionState::Connecting) => {
                        inner.hosts.next(current, reason.as_ref())
                    }
                    _ => None,
                };
                match next {
                    Some(host) => {
                        tracing::info!(failed = ?current, next = %host, "trying fallback host");
                        let request = StateChangeRequest::new(ConnectionState::Connecting)
                            .with_reason(reason.clone())
                            .with_fallback(host, current);
                        self.commit(&mut inner, request)
                    }
                    None => None,
                }
            };
            if let Some(committed) = committed {
                self.enact(committed).await;
                return;
            }
        } else if candidate {
            tracing::info!("network unreachable; not trying fallback hosts");
        }

        let committed = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connecting {
                return;
            }
            inner.pending_connect = None;
            let target = self.suspend_target(&inner);
            self.commit(&mut inner, StateChangeRequest::new(target).with_reason(reason))
        };
        if let Some(committed) = committed {
            self.enact(committed).await;
        }
    }
}

// ===========================================
// Effects
// ===========================================

impl Shared {
    /// Run the side effects of a committed change, then tell listeners.
    pub(crate) async fn enact(self: &Arc<Self>, committed: Committed) {
        let Committed {
            previous,
            request,
            reason,
            update,
        } = committed;

        if update {
            self.emit(previous, previous, ConnectionEvent::Update, reason);
            return;
        }

        let state = request.state;
        let effect_reason = || {
            reason
                .clone()
                .or_else(|| self.states.descriptor(state).default_error.clone())
                .unwrap_or_else(ErrorInfo::failed)
        };

        for effect in self.states.enact(state) {
            tracing::trace!(%state, ?effect, "enacting");
            match effect {
                Effect::ConnectTransport => self.connect_transport(&request).await,
                Effect::ReleaseTransport => self.release_transport().await,
                Effect::SendClose => self.send_close(),
                Effect::ChannelsConnected => self.channels.set_connected(),
                Effect::SuspendChannels => {
                    tracing::debug!(channels = ?self.channels.channel_names(), "suspending channels");
                    self.channels.set_suspended(&effect_reason(), false)
                }
                Effect::DetachChannels => self.channels.detach_all(&effect_reason()),
                Effect::FailChannels => self.channels.fail_all(&effect_reason()),
                Effect::FlushQueue => self.flush_queue(),
                Effect::FailQueue => self.fail_queue(&effect_reason()),
                Effect::FailPending => self.fail_pending(&effect_reason()),
                Effect::ClearIdentity => {
                    self.inner.lock().identity = None;
                }
            }
        }

        self.emit(previous, state, state.into(), reason);
    }

    pub(crate) fn emit(
        &self,
        previous: ConnectionState,
        current: ConnectionState,
        event: ConnectionEvent,
        reason: Option<ErrorInfo>,
    ) {
        let retry_in = match event {
            ConnectionEvent::Disconnected | ConnectionEvent::Suspended => {
                self.states.descriptor(current).timeout
            }
            _ => None,
        };
        // No subscribers is fine.
        let _ = self.events.send(ConnectionStateChange {
            previous,
            current,
            event,
            reason,
            retry_in,
        });
    }

    async fn connect_transport(self: &Arc<Self>, request: &StateChangeRequest) {
        let auth = match self.auth.auth_params() {
            Ok(auth) => auth,
            Err(reason) => {
                tracing::warn!(%reason, "no credentials for connection attempt");
                self.abandon_attempt(reason);
                return;
            }
        };

        let (transport_id, transport, stale) = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connecting || inner.shutdown {
                return;
            }
            let stale = inner.transport.take();
            if request.fallback_host.is_none() {
                inner.hosts.reset();
            }
            let host = request
                .fallback_host
                .clone()
                .unwrap_or_else(|| inner.hosts.primary().to_string());
            let mode = connect_mode(&inner);
            tracing::info!(%host, mode = mode.as_str(), "opening transport");

            let transport = self.transports.create(TransportParams {
                host: host.clone(),
                mode,
                auth,
            });
            inner.next_transport_id += 1;
            let transport_id = inner.next_transport_id;
            inner.transport = Some(ActiveTransport {
                id: transport_id,
                host: transport.host().to_string(),
                handle: Arc::clone(&transport),
            });
            inner.pending_connect = Some(host);
            (transport_id, transport, stale)
        };

        if let Some(stale) = stale {
            stale.handle.close().await;
        }

        let listener = TransportListener::new(Arc::downgrade(self), transport_id);
        if let Err(e) = transport.connect(listener).await {
            tracing::warn!(error = %e, "transport connect failed");
            self.on_transport_failure(transport_id, Some(e.to_error_info()));
        }
    }

    /// Give up on the current attempt before a transport exists.
    fn abandon_attempt(self: &Arc<Self>, reason: ErrorInfo) {
        let fatal = self.classifier().is_fatal(Some(&reason));
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Connecting {
            return;
        }
        inner.pending_connect = None;
        let target = if fatal {
            ConnectionState::Failed
        } else {
            self.suspend_target(&inner)
        };
        self.commit_now(&mut inner, StateChangeRequest::new(target).with_reason(Some(reason)));
    }

    async fn release_transport(&self) {
        let released = self.inner.lock().transport.take();
        if let Some(active) = released {
            tracing::debug!(host = %active.host, "releasing transport");
            active.handle.close().await;
        }
    }

    fn send_close(self: &Arc<Self>) {
        let released = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Closing {
                return;
            }
            if let Some(active) = inner.transport.as_ref() {
                match active.handle.send(ProtocolMessage::close()) {
                    Ok(()) => return,
                    Err(e) => tracing::debug!(error = %e, "close not sent; closing locally"),
                }
            }
            let released = inner.transport.take();
            self.commit_now(&mut inner, StateChangeRequest::new(ConnectionState::Closed));
            released
        };
        if let Some(active) = released {
            self.close_in_background(active);
        }
    }

    fn flush_queue(&self) {
        let mut completions = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !self.states.descriptor(inner.state).send_events {
                return;
            }
            let Some(transport) = inner.transport.as_ref().map(|t| Arc::clone(&t.handle)) else {
                return;
            };
            let queued: Vec<QueuedMessage> = inner.queue.drain(..).collect();
            if !queued.is_empty() {
                tracing::debug!(count = queued.len(), "flushing queued messages");
            }
            for QueuedMessage { message, callback } in queued {
                match self.send_via(transport.as_ref(), message, callback) {
                    Ok(callback) => completions.push((callback, Ok(()))),
                    Err(failure) => completions.push((failure.callback, Err(failure.error))),
                }
            }
        }
        for (callback, result) in completions {
            complete(callback, result);
        }
    }

    fn fail_queue(&self, reason: &ErrorInfo) {
        let queued: Vec<QueuedMessage> = self.inner.lock().queue.drain(..).collect();
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), %reason, "failing queued messages");
        }
        for queued in queued {
            complete(queued.callback, Err(reason.clone()));
        }
    }

    fn fail_pending(&self, reason: &ErrorInfo) {
        let pending = self.ledger.lock().drain();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), %reason, "failing pending messages");
        }
        for callback in pending {
            complete(callback, Err(reason.clone()));
        }
    }
}

fn connect_mode(inner: &Inner) -> ConnectMode {
    if let Some(key) = inner.identity.as_ref().and_then(|i| i.key.clone()) {
        return ConnectMode::Resume { key };
    }
    match &inner.recover {
        Some(recover) => ConnectMode::Recover {
            key: recover.connection_key.clone(),
        },
        None => ConnectMode::Clean,
    }
}
