//! Bridges the local variable memory of Siemens LOGO! controllers to MQTT
//! using [Tokio](https://docs.rs/tokio) and Rust's `async/await` syntax.
//!
//! # Features
//!
//! * Polls ranges of controller memory on a fixed cycle without drift
//! * Detects changes at byte level and notifies typed variables
//! * Publishes changed values and writes values received on subscribed topics
//! * Serializes all access to a controller through a single session task
//! * Reconnects to the controller and to the broker after failures
//!
//! # Overview
//!
//! A [`HardwareSession`](session::HardwareSession) owns the connection to
//! one controller. A [`MemoryRangePoller`](poller::MemoryRangePoller) per
//! range reads memory through the session and reports changed spans to a
//! [`VariableRegistry`](registry::VariableRegistry), which notifies every
//! variable overlapping a changed span. A
//! [`TransportBridge`](bridge::TransportBridge) publishes those changes and
//! turns inbound messages into writes.
//!
//! [`Engine`](engine::Engine) assembles all of this from a
//! [`Config`](config::Config).
//!
//! # Example
//!
//! ```no_run
//! use logobridge::config::Config;
//! use logobridge::engine::Engine;
//! use logobridge::transport::mqtt::MqttTransportFactory;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     let engine = Engine::start(&config, &MqttTransportFactory::default())?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

/// publish and subscribe bindings between topics and variables
pub mod bridge;
/// value conversions
pub mod codec;
/// configuration document
pub mod config;
/// assembly of sessions, pollers and bridges
pub mod engine;
/// error types
pub mod error;
/// in-memory controller
pub mod memory;
/// fixed cycle polling of memory ranges
pub mod poller;
/// typed variables and their listeners
pub mod registry;
pub mod s7;
/// serialized access to a controller
pub mod session;
pub mod transport;
/// core data types
pub mod types;

mod buffer;
