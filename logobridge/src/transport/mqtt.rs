use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error::TransportError;
use crate::transport::{
    BrokerSettings, InboundMessage, Transport, TransportConnection, TransportFactory,
    DEFAULT_INBOUND_CAPACITY,
};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;

impl From<ClientError> for TransportError {
    fn from(err: ClientError) -> Self {
        TransportError::Client(err.to_string())
    }
}

type Topics = Arc<Mutex<Vec<String>>>;

fn lock(topics: &Topics) -> MutexGuard<'_, Vec<String>> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MQTT client backed by `rumqttc`
///
/// A spawned task drives the connection. It reconnects after every error
/// and restores all subscriptions once the broker acknowledges the new
/// connection.
pub struct MqttTransport {
    client: AsyncClient,
    topics: Topics,
}

impl MqttTransport {
    /// Connect to `broker` and spawn the event loop task
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        broker: &BrokerSettings,
        client_id: &str,
        inbound_capacity: usize,
    ) -> TransportConnection {
        let mut options = MqttOptions::new(client_id, broker.host.as_str(), broker.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some((username, password)) = &broker.credentials {
            options.set_credentials(username.as_str(), password.as_str());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(inbound_capacity);
        let transport = Self::new(client);

        let task = EventLoopTask {
            event_loop,
            client: transport.client.clone(),
            topics: transport.topics.clone(),
            tx,
        };
        let driver = tokio::spawn(task.run().instrument(tracing::info_span!(
            "MQTT",
            client_id = %client_id,
            broker = %format!("{}:{}", broker.host, broker.port)
        )));

        TransportConnection {
            transport: Arc::new(transport),
            inbound: rx,
            driver: Some(driver),
        }
    }

    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            topics: Topics::default(),
        }
    }
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        {
            let mut topics = lock(&self.topics);
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        lock(&self.topics).retain(|t| t != topic);
        self.client.try_unsubscribe(topic)?;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.client.try_disconnect()?;
        Ok(())
    }
}

struct EventLoopTask {
    event_loop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    tx: mpsc::Sender<InboundMessage>,
}

impl EventLoopTask {
    /// runs until the disconnect request was sent
    ///
    /// The receiver going away does not stop the loop, the pending
    /// unsubscribes and the disconnect still have to reach the broker.
    async fn run(mut self) {
        let mut connected_before = false;

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("connected");
                    // clean sessions lose their subscriptions on reconnect
                    if connected_before {
                        self.resubscribe();
                    }
                    connected_before = true;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if self.tx.send(message).await.is_err() {
                        tracing::debug!("no receiver for message on {}", topic);
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::info!("disconnected");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("connection error: {}", err);
                    // nothing left to deliver and nothing to say goodbye on
                    if self.tx.is_closed() {
                        break;
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }

        tracing::info!("event loop stopped");
    }

    fn resubscribe(&self) {
        for topic in lock(&self.topics).iter() {
            if let Err(err) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                tracing::warn!("unable to resubscribe to {}: {}", topic, err);
            }
        }
    }
}

/// Creates [`MqttTransport`] clients
#[derive(Clone, Copy, Debug)]
pub struct MqttTransportFactory {
    inbound_capacity: usize,
}

impl MqttTransportFactory {
    /// create a factory whose clients queue up to `inbound_capacity` messages
    pub fn new(inbound_capacity: usize) -> Self {
        Self { inbound_capacity }
    }
}

impl Default for MqttTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_INBOUND_CAPACITY)
    }
}

impl TransportFactory for MqttTransportFactory {
    fn connect(
        &self,
        broker: &BrokerSettings,
        client_id: &str,
    ) -> Result<TransportConnection, TransportError> {
        Ok(MqttTransport::connect(
            broker,
            client_id,
            self.inbound_capacity,
        ))
    }
}
