//! Shared fixtures for connection manager scenarios.
//!
//! Every scenario runs on a paused clock: whenever all tasks are idle the
//! runtime jumps to the next timer, so state timeouts fire instantly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rtwire_client::{
    AssumeOnline, ChannelRegistry, Collaborators, CompletionCallback, ConnectionEvent,
    ConnectionManager, ConnectionOptions, ConnectionState, ConnectionStateChange, ErrorInfo,
    MockTransport, MockTransportFactory, ProtocolMessage,
};
use tokio::sync::broadcast::Receiver;

pub const PRIMARY: &str = "main.test";
pub const FALLBACKS: [&str; 2] = ["fb1.test", "fb2.test"];

/// Options pointing at the test hosts.
pub fn options() -> ConnectionOptions {
    ConnectionOptions::default()
        .with_host(PRIMARY)
        .with_fallback_hosts(&FALLBACKS)
}

/// A manager over mock transports, with its factory and an event stream.
pub struct Harness {
    pub manager: ConnectionManager,
    pub factory: MockTransportFactory,
    pub channels: Arc<RecordingChannels>,
    pub events: Receiver<ConnectionStateChange>,
}

impl Harness {
    pub fn new(options: ConnectionOptions) -> Self {
        Self::with_collaborators(options, |c| c)
    }

    pub fn with_collaborators(
        options: ConnectionOptions,
        configure: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        init_tracing();
        let factory = MockTransportFactory::new();
        let channels = Arc::new(RecordingChannels::default());
        let collaborators = Collaborators::new(Arc::new(factory.clone()))
            .with_channels(channels.clone())
            .with_connectivity(Arc::new(AssumeOnline(true)));
        let manager = ConnectionManager::new(options, configure(collaborators)).unwrap();
        let events = manager.subscribe();
        Self {
            manager,
            factory,
            channels,
            events,
        }
    }

    /// Next state change, advancing the paused clock as needed.
    pub async fn next_change(&mut self) -> ConnectionStateChange {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("no state change within 600s")
            .expect("event stream closed")
    }

    /// Skip changes until `event`, returning it and everything before it.
    pub async fn wait_for(&mut self, event: ConnectionEvent) -> Vec<ConnectionStateChange> {
        let mut seen = Vec::new();
        loop {
            let change = self.next_change().await;
            let done = change.event == event;
            seen.push(change);
            if done {
                return seen;
            }
        }
    }

    /// The change that ended [`wait_for`](Self::wait_for).
    pub async fn expect(&mut self, event: ConnectionEvent) -> ConnectionStateChange {
        let mut seen = self.wait_for(event).await;
        seen.pop().expect("wait_for returns at least one change")
    }

    /// Connect and accept on the first transport.
    pub async fn connect(&mut self, connection_id: &str, key: &str) -> MockTransport {
        self.manager.connect();
        self.expect(ConnectionEvent::Connecting).await;
        let transport = self.factory.last().expect("a transport was created");
        transport.accept(connection_id, key);
        self.expect(ConnectionEvent::Connected).await;
        transport
    }

    /// Wait until a transport beyond the first `count` exists.
    pub async fn transport_after(&mut self, count: usize) -> MockTransport {
        while self.factory.count() <= count {
            self.expect(ConnectionEvent::Connecting).await;
        }
        self.factory.last().expect("a transport was created")
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }
}

/// Route logs to the test writer; `RUST_LOG=rtwire_client=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run without advancing time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Results delivered to completion callbacks, tagged by message.
#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<Vec<(u32, Result<(), ErrorInfo>)>>>);

impl Outcomes {
    pub fn callback(&self, tag: u32) -> Option<CompletionCallback> {
        let outcomes = self.0.clone();
        Some(Box::new(move |result| outcomes.lock().push((tag, result))))
    }

    pub fn all(&self) -> Vec<(u32, Result<(), ErrorInfo>)> {
        self.0.lock().clone()
    }

    pub fn tags(&self) -> Vec<u32> {
        self.0.lock().iter().map(|(tag, _)| *tag).collect()
    }

    pub fn get(&self, tag: u32) -> Option<Result<(), ErrorInfo>> {
        self.0
            .lock()
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, r)| r.clone())
    }
}

/// Channel registry that records what it was told.
#[derive(Default)]
pub struct RecordingChannels {
    log: Mutex<Vec<String>>,
}

impl RecordingChannels {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }
}

impl ChannelRegistry for RecordingChannels {
    fn on_channel_message(&self, message: ProtocolMessage) {
        self.record(format!(
            "message:{}",
            message.channel.unwrap_or_default()
        ));
    }

    fn set_connected(&self) {
        self.record("connected".into());
    }

    fn set_suspended(&self, reason: &ErrorInfo, resume_failed: bool) {
        self.record(format!("suspended:{}:{}", reason.code, resume_failed));
    }

    fn reattach(&self, _reason: Option<&ErrorInfo>) {
        self.record("reattach".into());
    }

    fn detach_all(&self, reason: &ErrorInfo) {
        self.record(format!("detach:{}", reason.code));
    }

    fn fail_all(&self, reason: &ErrorInfo) {
        self.record(format!("fail:{}", reason.code));
    }

    fn channel_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A message that needs an ack.
pub fn chat(n: u8) -> ProtocolMessage {
    ProtocolMessage::message("chat", vec![n])
}
