//! Kamstrup heat meter reader
//!
//! This library polls a Kamstrup meter over its optical or serial port,
//! decodes the configured registers and hands every poll result to its
//! consumers (MQTT, logging).

pub mod config;
pub mod coordinator;
pub mod kamstrup;
#[cfg(feature = "mqtt")]
pub mod mqtt;

// Re-export common types for easier access
pub use config::{Config, ConfigError};
pub use coordinator::{CycleOutcome, Integration, PollCoordinator, PollEvent, SetupError, Snapshot};
pub use kamstrup::{Kamstrup, KamstrupError, ProtocolError, Reading, TransportError};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttManager;
