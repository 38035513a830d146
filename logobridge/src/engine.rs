use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bridge::TransportBridge;
use crate::config::{Config, ControllerConfig};
use crate::error::StartError;
use crate::poller::{MemoryRangePoller, PollerHandle};
use crate::registry::VariableRegistry;
use crate::s7::{S7Connector, S7Settings};
use crate::session::{Connector, HardwareSession};
use crate::transport::{BrokerSettings, Transport, TransportFactory};

/// maximum number of requests waiting for a hardware session
pub const MAX_QUEUED_REQUESTS: usize = 16;

/// time a transport gets to deliver its disconnect before it is aborted
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds and starts everything described by a [`Config`]
#[derive(Clone, Copy, Debug)]
pub struct Engine;

impl Engine {
    /// Start with S7 connections to every controller
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &Config,
        transports: &dyn TransportFactory,
    ) -> Result<EngineHandle, StartError> {
        Self::start_with(
            config,
            |_, endpoint| S7Connector::new(endpoint, S7Settings::default()),
            transports,
        )
    }

    /// Start using `connector` to create the connector of each controller
    ///
    /// The configuration is validated first. If starting a later part fails,
    /// everything already started is stopped in the background.
    pub fn start_with<C, F>(
        config: &Config,
        mut connector: F,
        transports: &dyn TransportFactory,
    ) -> Result<EngineHandle, StartError>
    where
        C: Connector,
        F: FnMut(&ControllerConfig, SocketAddr) -> C,
    {
        config.validate()?;
        let broker = config.broker()?;
        tracing::info!("MQTT broker at {}:{}", broker.host, broker.port);

        let mut handle = EngineHandle {
            controllers: Vec::new(),
        };

        for controller in &config.controllers {
            let endpoint = controller.endpoint()?;
            tracing::info!("controller at {}", endpoint);

            let (session, task) = HardwareSession::spawn(
                &endpoint.to_string(),
                connector(controller, endpoint),
                MAX_QUEUED_REQUESTS,
            );
            let mut running = ControllerHandle {
                endpoint,
                pollers: Vec::new(),
                bridges: Vec::new(),
                transports: Vec::new(),
                session: task,
            };

            let result = start_controller(controller, &session, transports, &broker, &mut running);
            handle.controllers.push(running);
            if let Err(err) = result {
                tracing::error!("unable to start {}: {}", endpoint, err);
                tokio::spawn(handle.stop());
                return Err(err);
            }
        }

        Ok(handle)
    }
}

fn start_controller(
    controller: &ControllerConfig,
    session: &HardwareSession,
    transports: &dyn TransportFactory,
    broker: &BrokerSettings,
    running: &mut ControllerHandle,
) -> Result<(), StartError> {
    let registry = VariableRegistry::new();
    let ranges: Vec<_> = controller
        .ranges()?
        .into_iter()
        .map(|range| (registry.add_range(range), range))
        .collect();

    // bridges first, so that the first poll cycle is published
    for client in &controller.mqtt {
        tracing::info!("MQTT client {}", client.client_id);
        let bindings = client.bindings()?;
        for binding in &bindings {
            tracing::info!(
                "{:?} {} ({})",
                binding.direction,
                binding.topic,
                binding.variable
            );
        }

        let mut connection = transports.connect(broker, &client.client_id)?;
        running.transports.push(RunningTransport {
            transport: connection.transport.clone(),
            driver: connection.driver.take(),
        });
        running.bridges.push(TransportBridge::start(
            &bindings,
            registry.clone(),
            session.clone(),
            connection,
        )?);
    }

    for (id, range) in ranges {
        let poller =
            MemoryRangePoller::new(id, range, session.clone(), Arc::new(registry.clone()));
        running.pollers.push(poller.spawn());
    }

    Ok(())
}

struct RunningTransport {
    transport: Arc<dyn Transport>,
    driver: Option<JoinHandle<()>>,
}

impl RunningTransport {
    async fn disconnect(self) {
        if let Err(err) = self.transport.disconnect() {
            tracing::warn!("unable to disconnect: {}", err);
        }

        let Some(driver) = self.driver else {
            return;
        };
        let abort = driver.abort_handle();
        match tokio::time::timeout(DISCONNECT_TIMEOUT, driver).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("transport task failed: {}", err),
            Err(_) => {
                tracing::warn!(
                    "transport did not disconnect within {} s",
                    DISCONNECT_TIMEOUT.as_secs()
                );
                abort.abort();
            }
        }
    }
}

struct ControllerHandle {
    endpoint: SocketAddr,
    pollers: Vec<PollerHandle>,
    bridges: Vec<TransportBridge>,
    transports: Vec<RunningTransport>,
    session: JoinHandle<()>,
}

impl ControllerHandle {
    async fn stop(self) {
        for poller in self.pollers {
            poller.stop().await;
        }

        for bridge in self.bridges {
            bridge.stop().await;
        }

        // the last session handle went away with the pollers and bridges
        if let Err(err) = self.session.await {
            tracing::warn!("session task for {} failed: {}", self.endpoint, err);
        }

        // the bridges have unsubscribed, the disconnect goes out after that
        for transport in self.transports {
            transport.disconnect().await;
        }

        tracing::info!("stopped {}", self.endpoint);
    }
}

/// Running pollers, sessions and bridges
pub struct EngineHandle {
    controllers: Vec<ControllerHandle>,
}

impl EngineHandle {
    /// Stop every poller at its next sleep boundary, close the hardware
    /// sessions and disconnect the transports
    pub async fn stop(self) {
        for controller in self.controllers {
            controller.stop().await;
        }
    }
}
