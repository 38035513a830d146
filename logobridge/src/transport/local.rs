use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{
    BrokerSettings, InboundMessage, Transport, TransportConnection, TransportFactory,
    DEFAULT_INBOUND_CAPACITY,
};

struct State {
    published: Vec<(String, Vec<u8>)>,
    topics: Vec<String>,
    connected: bool,
    fail_publish: bool,
}

/// In-memory transport that records publications and delivers injected messages
///
/// Clones share the same state, so a test keeps one clone while the bridge
/// owns another.
#[derive(Clone)]
pub struct LocalTransport {
    state: Arc<Mutex<State>>,
    tx: mpsc::Sender<InboundMessage>,
}

impl LocalTransport {
    /// create a connected transport and the receiving end of its inbound queue
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Self {
            state: Arc::new(Mutex::new(State {
                published: Vec::new(),
                topics: Vec::new(),
                connected: true,
                fail_publish: false,
            })),
            tx,
        };
        (transport, rx)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// every publication so far as (topic, payload)
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// payloads published on `topic`, as text
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    /// currently subscribed topics
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().topics.clone()
    }

    /// false once [`Transport::disconnect`] was called
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// while set, every publication fails
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Deliver a message as if it was received from the broker
    ///
    /// Returns false if nobody subscribed to `topic` or the transport is
    /// disconnected.
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        {
            let state = self.lock();
            if !state.connected || !state.topics.iter().any(|t| t == topic) {
                return false;
            }
        }

        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        self.tx.send(message).await.is_ok()
    }
}

impl Transport for LocalTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected || state.fail_publish {
            return Err(TransportError::Disconnected);
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if !state.topics.iter().any(|t| t == topic) {
            state.topics.push(topic.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.lock().topics.retain(|t| t != topic);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.lock().connected = false;
        Ok(())
    }
}

/// Creates a [`LocalTransport`] per client id and keeps them for inspection
#[derive(Clone, Default)]
pub struct LocalTransportFactory {
    clients: Arc<Mutex<Vec<(String, LocalTransport)>>>,
}

impl LocalTransportFactory {
    /// create a factory without any clients
    pub fn new() -> Self {
        Self::default()
    }

    /// the transport created for `client_id`
    pub fn client(&self, client_id: &str) -> Option<LocalTransport> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(id, _)| id == client_id)
            .map(|(_, transport)| transport.clone())
    }
}

impl TransportFactory for LocalTransportFactory {
    fn connect(
        &self,
        _broker: &BrokerSettings,
        client_id: &str,
    ) -> Result<TransportConnection, TransportError> {
        let (transport, inbound) = LocalTransport::new(DEFAULT_INBOUND_CAPACITY);
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((client_id.to_string(), transport.clone()));
        Ok(TransportConnection {
            transport: Arc::new(transport),
            inbound,
            driver: None,
        })
    }
}
