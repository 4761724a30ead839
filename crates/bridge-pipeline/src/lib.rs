//! Ventilator to HL7 Bridge Pipeline
//!
//! Wires the serial protocol, HL7 mapping and transport crates into one
//! supervised pipeline with reconnection, retry and bounded redelivery.
//! External wrappers only need [`start`], [`BridgeHandle::stop`],
//! [`BridgeHandle::health`] and [`BridgeHandle::subscribe`].

mod config;
mod coordinator;
mod emission;
mod events;
mod handle;

pub use config::{BridgeConfig, ConfigError, ReconnectPolicy};
pub use emission::{EmissionGate, EmitPolicy};
pub use events::{BridgeEvent, HealthStatus};
pub use handle::{start, start_with, BridgeHandle, StopOutcome};
