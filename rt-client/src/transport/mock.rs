//! Mock transport for testing.
//!
//! Captures sent messages for verification and lets a test play the server:
//! make the transport available, deliver inbound messages, or fail it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rtwire_types::{ConnectionDetails, ErrorInfo, ProtocolMessage};

use super::{Transport, TransportError, TransportFactory, TransportListener, TransportParams};

/// Mock transport for testing.
///
/// Clones share state, so a test can keep a handle while the manager owns
/// another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    params: TransportParams,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    listener: Option<TransportListener>,
    connected: bool,
    closed: bool,
    sent_messages: Vec<ProtocolMessage>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
}

impl MockTransport {
    /// Create a mock transport for `params`.
    pub fn new(params: TransportParams) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner::default())),
            params,
        }
    }

    /// Parameters the transport was created with.
    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<ProtocolMessage> {
        self.inner.lock().sent_messages.clone()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<ProtocolMessage> {
        self.inner.lock().sent_messages.last().cloned()
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.inner.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner.lock().fail_next_send = Some(error.to_string());
    }

    /// Whether connect() succeeded and close() has not been called.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Whether close() was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Report the transport as available.
    pub fn make_available(&self) {
        if let Some(listener) = self.listener() {
            listener.on_available();
        }
    }

    /// Deliver an inbound message.
    pub fn deliver(&self, message: ProtocolMessage) {
        if let Some(listener) = self.listener() {
            listener.on_message(message);
        }
    }

    /// Report the transport as failed.
    pub fn fail(&self, reason: Option<ErrorInfo>) {
        if let Some(listener) = self.listener() {
            listener.on_unavailable(reason);
        }
    }

    /// Make the transport available and confirm the connection.
    pub fn accept(&self, connection_id: &str, connection_key: &str) {
        self.accept_with(
            connection_id,
            ConnectionDetails {
                connection_key: Some(connection_key.to_string()),
                ..ConnectionDetails::default()
            },
        );
    }

    /// Like [`accept`](Self::accept) with explicit connection details.
    pub fn accept_with(&self, connection_id: &str, details: ConnectionDetails) {
        self.make_available();
        self.deliver(ProtocolMessage::connected(connection_id, details));
    }

    // Listener calls may re-enter send(), so never hold the lock across one.
    fn listener(&self) -> Option<TransportListener> {
        self.inner.lock().listener.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, listener: TransportListener) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.listener = Some(listener);
        Ok(())
    }

    fn send(&self, message: ProtocolMessage) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(message);
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.closed = true;
    }

    fn host(&self) -> &str {
        &self.params.host
    }
}

/// Factory handing out [`MockTransport`]s and remembering each one.
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    created: Arc<Mutex<Vec<MockTransport>>>,
    fail_next_connect: Arc<Mutex<Option<String>>>,
}

impl MockTransportFactory {
    /// Create a factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport created so far, oldest first.
    pub fn created(&self) -> Vec<MockTransport> {
        self.created.lock().clone()
    }

    /// The most recently created transport.
    pub fn last(&self) -> Option<MockTransport> {
        self.created.lock().last().cloned()
    }

    /// Number of transports created.
    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    /// Make the next created transport fail its connect().
    pub fn fail_next_connect(&self, error: &str) {
        *self.fail_next_connect.lock() = Some(error.to_string());
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, params: TransportParams) -> Arc<dyn Transport> {
        let transport = MockTransport::new(params);
        if let Some(error) = self.fail_next_connect.lock().take() {
            transport.fail_next_connect(&error);
        }
        self.created.lock().push(transport.clone());
        Arc::new(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectMode;
    use std::sync::Weak;

    fn params(host: &str) -> TransportParams {
        TransportParams {
            host: host.to_string(),
            mode: ConnectMode::Clean,
            auth: Vec::new(),
        }
    }

    fn detached_listener() -> TransportListener {
        TransportListener::new(Weak::new(), 1)
    }

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new(params("main"));
        assert!(!transport.is_connected());

        transport.connect(detached_listener()).await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(transport.host(), "main");
    }

    #[tokio::test]
    async fn mock_transport_sends_messages() {
        let transport = MockTransport::new(params("main"));
        transport.connect(detached_listener()).await.unwrap();

        transport.send(ProtocolMessage::message("a", b"1".to_vec())).unwrap();
        transport.send(ProtocolMessage::message("a", b"2".to_vec())).unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data.as_deref(), Some(&b"1"[..]));
        assert_eq!(sent[1].data.as_deref(), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new(params("main"));
        transport.connect(detached_listener()).await.unwrap();

        transport.close().await;

        assert!(!transport.is_connected());
        assert!(transport.is_closed());
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new(params("main"));

        let result = transport.send(ProtocolMessage::heartbeat());
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new(params("main"));
        transport.fail_next_connect("network unreachable");

        let result = transport.connect(detached_listener()).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new(params("main"));
        transport.connect(detached_listener()).await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send(ProtocolMessage::heartbeat());
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        transport.send(ProtocolMessage::heartbeat()).unwrap();
    }

    #[tokio::test]
    async fn scripting_before_connect_is_a_no_op() {
        let transport = MockTransport::new(params("main"));
        transport.make_available();
        transport.deliver(ProtocolMessage::heartbeat());
        transport.fail(None);
        assert!(transport.sent_messages().is_empty());
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_clone_shares_state() {
        let transport1 = MockTransport::new(params("main"));
        let transport2 = transport1.clone();

        transport1.connect(detached_listener()).await.unwrap();
        assert!(transport2.is_connected());

        transport1.send(ProtocolMessage::heartbeat()).unwrap();
        transport2.send(ProtocolMessage::heartbeat()).unwrap();

        assert_eq!(transport1.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn last_sent_returns_most_recent() {
        let transport = MockTransport::new(params("main"));
        transport.connect(detached_listener()).await.unwrap();

        assert!(transport.last_sent().is_none());

        transport.send(ProtocolMessage::heartbeat()).unwrap();
        transport.send(ProtocolMessage::close()).unwrap();

        let last = transport.last_sent().unwrap();
        assert_eq!(last.action, rtwire_types::ProtocolAction::Close);
    }

    // ===========================================
    // Factory Tests
    // ===========================================

    #[tokio::test]
    async fn factory_records_created_transports() {
        let factory = MockTransportFactory::new();
        assert!(factory.last().is_none());

        factory.create(params("one"));
        factory.create(params("two"));

        assert_eq!(factory.count(), 2);
        let hosts: Vec<String> = factory
            .created()
            .iter()
            .map(|t| t.params().host.clone())
            .collect();
        assert_eq!(hosts, vec!["one", "two"]);
        assert_eq!(factory.last().unwrap().params().host, "two");
    }

    #[tokio::test]
    async fn factory_forced_failure_applies_to_next_transport_only() {
        let factory = MockTransportFactory::new();
        factory.fail_next_connect("refused");

        let first = factory.create(params("one"));
        let second = factory.create(params("two"));

        assert!(first.connect(detached_listener()).await.is_err());
        assert!(second.connect(detached_listener()).await.is_ok());
    }
}
