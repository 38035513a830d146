//! Messaging transport used to publish values and receive writes
//!
//! The bridge only talks to the [`Transport`] trait. [`mqtt`] connects to an
//! MQTT broker and [`local`] keeps everything in memory.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;

/// in-memory transport for tests and local wiring
pub mod local;
/// MQTT transport backed by `rumqttc`
pub mod mqtt;

/// capacity of the queue carrying inbound messages to the bridge
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// A message received on a subscribed topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// topic the message was published on
    pub topic: String,
    /// raw payload
    pub payload: Vec<u8>,
}

/// Address and credentials of the message broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    /// host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// user name and password
    pub credentials: Option<(String, String)>,
}

/// A connected messaging client
///
/// Every method only enqueues the operation, so none of them block. Failures
/// are reported to the caller, who logs them; the client recovers on its own
/// by reconnecting and restoring its subscriptions.
pub trait Transport: Send + Sync + 'static {
    /// publish `payload` on `topic`
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// receive messages published on `topic`, now and after every reconnect
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// stop receiving messages published on `topic`
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// close the connection to the broker
    fn disconnect(&self) -> Result<(), TransportError>;
}

/// A transport together with the queue of messages it receives
pub struct TransportConnection {
    /// the client
    pub transport: Arc<dyn Transport>,
    /// messages received on subscribed topics
    pub inbound: mpsc::Receiver<InboundMessage>,
    /// task driving the client, finishes once the disconnect went out
    pub driver: Option<JoinHandle<()>>,
}

/// Creates one transport per configured client id
pub trait TransportFactory {
    /// connect to `broker` as `client_id`
    ///
    /// Must be called from within a tokio runtime.
    fn connect(
        &self,
        broker: &BrokerSettings,
        client_id: &str,
    ) -> Result<TransportConnection, TransportError>;
}
