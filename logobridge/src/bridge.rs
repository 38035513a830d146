use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::codec;
use crate::error::{HardwareError, ListenerError, StartError};
use crate::registry::{ChangeListener, VariableHandle, VariableRegistry};
use crate::session::HardwareSession;
use crate::transport::{InboundMessage, Transport, TransportConnection};
use crate::types::{Direction, TopicBinding, TypedVariable, Value};

/// Write `value` to the memory of `variable`
///
/// Bits are written with a read-modify-write of their byte so that the
/// sibling bits keep their state.
pub async fn write_value(
    session: &HardwareSession,
    variable: &TypedVariable,
    value: Value,
) -> Result<(), HardwareError> {
    match (value, variable.bit_offset()) {
        (Value::Bit(state), Some(bit)) => session.write_bit(variable.address(), bit, state).await,
        _ => {
            session
                .write_block(variable.address(), &codec::encode_binary(value, 0))
                .await
        }
    }
}

/// publishes every change of one variable on one topic
struct Publisher {
    topic: String,
    transport: Arc<dyn Transport>,
}

impl ChangeListener for Publisher {
    fn on_change(&self, variable: &TypedVariable, value: Value) -> Result<(), ListenerError> {
        let payload = codec::encode_text(value);
        tracing::debug!("{} changed, publishing '{}' on {}", variable, payload, self.topic);
        self.transport
            .publish(&self.topic, payload.into_bytes())
            .map_err(|error| ListenerError::Publish {
                topic: self.topic.clone(),
                error,
            })
    }
}

/// number of messages that may wait for the writer of one topic
pub const WRITER_QUEUE_CAPACITY: usize = 32;

type Route = (String, mpsc::Sender<Vec<u8>>);

/// Connects the topic bindings of one transport client to a controller
///
/// Publish bindings become listeners in the registry. Each subscribe binding
/// gets its own worker task that applies the messages of its topic in the
/// order they were received, so a slow write on one topic does not hold up
/// the others.
pub struct TransportBridge {
    transport: Arc<dyn Transport>,
    registry: VariableRegistry,
    published: Vec<VariableHandle>,
    subscribed: Vec<String>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl TransportBridge {
    /// Register and subscribe every binding, then start routing inbound messages
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        bindings: &[TopicBinding],
        registry: VariableRegistry,
        session: HardwareSession,
        connection: TransportConnection,
    ) -> Result<Self, StartError> {
        let TransportConnection {
            transport, inbound, ..
        } = connection;
        let mut published = Vec::new();
        let mut subscribed = Vec::new();
        let mut routes: Vec<Route> = Vec::new();
        let mut workers = Vec::new();

        for binding in bindings {
            match binding.direction {
                Direction::Publish => {
                    let handle = registry.register(binding.variable)?;
                    registry.subscribe(
                        handle,
                        Arc::new(Publisher {
                            topic: binding.topic.clone(),
                            transport: transport.clone(),
                        }),
                    )?;
                    published.push(handle);
                }
                Direction::Subscribe => {
                    let (tx, rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
                    let span = tracing::info_span!("Writer", topic = %binding.topic);
                    workers.push(tokio::spawn(
                        run_writer(binding.variable, session.clone(), rx).instrument(span),
                    ));
                    routes.push((binding.topic.clone(), tx));
                    if !subscribed.contains(&binding.topic) {
                        transport.subscribe(&binding.topic)?;
                        subscribed.push(binding.topic.clone());
                    }
                }
            }
        }

        let dispatcher = tokio::spawn(
            run_dispatcher(inbound, routes).instrument(tracing::info_span!("Dispatcher")),
        );

        Ok(Self {
            transport,
            registry,
            published,
            subscribed,
            dispatcher,
            workers,
        })
    }

    /// Stop publishing and receiving, then wait for queued writes to finish
    pub async fn stop(self) {
        for handle in self.published {
            // the registry may already have been torn down with its variables
            self.registry.unregister(handle).ok();
        }

        for topic in &self.subscribed {
            if let Err(err) = self.transport.unsubscribe(topic) {
                tracing::warn!("unable to unsubscribe from {}: {}", topic, err);
            }
        }

        // dropping the routes lets every writer drain its queue and exit
        self.dispatcher.abort();
        self.dispatcher.await.ok();
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::warn!("writer task failed: {}", err);
            }
        }
    }
}

async fn run_dispatcher(mut inbound: mpsc::Receiver<InboundMessage>, routes: Vec<Route>) {
    while let Some(message) = inbound.recv().await {
        let mut delivered = false;
        for (topic, tx) in routes.iter().filter(|(topic, _)| *topic == message.topic) {
            match tx.try_send(message.payload.clone()) {
                Ok(()) => delivered = true,
                Err(TrySendError::Full(payload)) => {
                    delivered = true;
                    tracing::warn!(
                        "writer queue for {} is full, discarding '{}'",
                        topic,
                        String::from_utf8_lossy(&payload)
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        if !delivered {
            tracing::debug!("no binding for message on {}", message.topic);
        }
    }
}

async fn run_writer(
    variable: TypedVariable,
    session: HardwareSession,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = rx.recv().await {
        let value = match codec::decode_text(variable.kind(), &payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("dropping message for {}: {}", variable, err);
                continue;
            }
        };

        match write_value(&session, &variable, value).await {
            Ok(()) => tracing::debug!("wrote {} to {}", value, variable),
            Err(err) => tracing::warn!("unable to write {} to {}: {}", value, variable, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::memory::{MemoryController, WriteRecord};
    use crate::transport::local::LocalTransport;
    use crate::types::{ChangeEvent, MemoryRange, Span};

    struct Fixture {
        controller: MemoryController,
        registry: VariableRegistry,
        transport: LocalTransport,
        bridge: TransportBridge,
    }

    fn start(bindings: &[TopicBinding]) -> Fixture {
        let controller = MemoryController::new();
        let (session, _) = HardwareSession::spawn("test", controller.clone(), 16);
        let registry = VariableRegistry::new();
        registry.add_range(MemoryRange::new(0, 850, Duration::from_millis(100)).unwrap());
        let (transport, inbound) = LocalTransport::new(16);
        let connection = TransportConnection {
            transport: Arc::new(transport.clone()),
            inbound,
            driver: None,
        };
        let bridge = TransportBridge::start(bindings, registry.clone(), session, connection).unwrap();
        Fixture {
            controller,
            registry,
            transport,
            bridge,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn change(start: u16, bytes: &[u8]) -> ChangeEvent {
        ChangeEvent {
            range: crate::types::RangeId(0),
            span: Span::new(start, start + bytes.len() as u16 - 1),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_integer_payload_as_big_endian_block() {
        let fixture = start(&[TopicBinding::subscribe(
            "set/integer/at/5",
            TypedVariable::integer(5).unwrap(),
        )]);

        assert!(fixture.transport.inject("set/integer/at/5", b"1337").await);
        settle().await;

        assert_eq!(
            fixture.controller.writes(),
            vec![WriteRecord {
                start: 5,
                data: vec![0x05, 0x39]
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn malformed_payload_is_dropped_and_next_message_succeeds() {
        let fixture = start(&[TopicBinding::subscribe(
            "set/integer/at/5",
            TypedVariable::integer(5).unwrap(),
        )]);

        fixture.transport.inject("set/integer/at/5", b"abc").await;
        settle().await;
        assert!(fixture.controller.writes().is_empty());

        fixture.transport.inject("set/integer/at/5", b"-2").await;
        settle().await;
        assert_eq!(
            fixture.controller.writes(),
            vec![WriteRecord {
                start: 5,
                data: vec![0xFF, 0xFE]
            }]
        );
        logs_assert(|lines: &[&str]| {
            let dropped = lines
                .iter()
                .filter(|line| line.contains("dropping message") && line.contains("'abc'"))
                .count();
            match dropped {
                1 => Ok(()),
                n => Err(format!("expected one dropped message, logged {n}")),
            }
        });
    }

    #[tokio::test]
    #[traced_test]
    async fn full_writer_queue_discards_the_message_with_a_warning() {
        let (inbound_tx, inbound) = mpsc::channel(4);
        let (tx, mut rx) = mpsc::channel(1);
        let routes = vec![("set/byte/at/9".to_string(), tx)];

        for payload in [b"1", b"2"] {
            inbound_tx
                .send(InboundMessage {
                    topic: "set/byte/at/9".to_string(),
                    payload: payload.to_vec(),
                })
                .await
                .unwrap();
        }
        drop(inbound_tx);
        run_dispatcher(inbound, routes).await;

        assert_eq!(rx.recv().await, Some(b"1".to_vec()));
        assert_eq!(rx.recv().await, None);
        assert!(logs_contain("writer queue for set/byte/at/9 is full, discarding '2'"));
    }

    #[tokio::test(start_paused = true)]
    async fn bit_binding_preserves_sibling_bits() {
        let fixture = start(&[TopicBinding::subscribe(
            "set/bit/at/7.3",
            TypedVariable::bit(7, 3).unwrap(),
        )]);
        fixture.controller.set_bytes(7, &[0b1111_0000]);

        fixture.transport.inject("set/bit/at/7.3", b"1").await;
        settle().await;
        assert_eq!(fixture.controller.bytes(7, 1), vec![0b1111_1000]);

        fixture.transport.inject("set/bit/at/7.3", b"0").await;
        settle().await;
        assert_eq!(fixture.controller.bytes(7, 1), vec![0b1111_0000]);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_for_one_topic_apply_in_delivery_order() {
        let fixture = start(&[TopicBinding::subscribe(
            "set/byte/at/9",
            TypedVariable::byte(9).unwrap(),
        )]);

        for value in 0..20u8 {
            fixture
                .transport
                .inject("set/byte/at/9", value.to_string().as_bytes())
                .await;
        }
        settle().await;

        let written: Vec<u8> = fixture
            .controller
            .writes()
            .into_iter()
            .map(|w| w.data[0])
            .collect();
        assert_eq!(written, (0..20u8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_every_change_as_text() {
        let fixture = start(&[
            TopicBinding::publish("get/byte/at/5", TypedVariable::byte(5).unwrap()),
            TopicBinding::publish("get/float/at/10", TypedVariable::float(10).unwrap()),
        ]);

        fixture.registry.on_change(&[change(5, &[0x2A])]);
        fixture
            .registry
            .on_change(&[change(10, &1.25f32.to_be_bytes())]);
        // same value again after a byte level change elsewhere in the span
        fixture.registry.on_change(&[change(5, &[0x2A])]);

        assert_eq!(fixture.transport.published_on("get/byte/at/5"), vec!["42", "42"]);
        assert_eq!(fixture.transport.published_on("get/float/at/10"), vec!["1.25"]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failures_do_not_stop_later_publications() {
        let fixture = start(&[TopicBinding::publish(
            "get/byte/at/5",
            TypedVariable::byte(5).unwrap(),
        )]);

        fixture.transport.fail_publishes(true);
        fixture.registry.on_change(&[change(5, &[1])]);
        fixture.transport.fail_publishes(false);
        fixture.registry.on_change(&[change(5, &[2])]);

        assert_eq!(fixture.transport.published_on("get/byte/at/5"), vec!["2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_topics_and_variables() {
        let fixture = start(&[
            TopicBinding::publish("get/byte/at/5", TypedVariable::byte(5).unwrap()),
            TopicBinding::subscribe("set/byte/at/6", TypedVariable::byte(6).unwrap()),
        ]);
        assert_eq!(fixture.transport.subscriptions(), vec!["set/byte/at/6"]);

        fixture.bridge.stop().await;
        fixture.registry.on_change(&[change(5, &[1])]);

        assert!(fixture.transport.subscriptions().is_empty());
        assert!(fixture.transport.published().is_empty());
        assert!(!fixture.transport.inject("set/byte/at/6", b"1").await);
    }
}
