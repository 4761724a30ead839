//! HL7 Transport
//!
//! Delivers encoded observation messages to the receiving system:
//! - MLLP over a persistent TCP connection, with ACK/NAK handling
//! - Atomic writes to a file sink
//! - Bounded retry with jittered exponential backoff

mod backoff;
mod file;
mod mllp;
mod sender;

pub use backoff::ExponentialBackoff;
pub use file::{FileLayout, FileSink, FileSinkConfig};
pub use mllp::{frame_message, parse_reply, MllpConfig, MllpSink};
pub use sender::{
    AttemptOutcome, DeliveryAttempt, RetryPolicy, SendOutcome, Sender, DEFAULT_SHUTDOWN_GRACE,
};

use async_trait::async_trait;
use hl7_encoder::ObservationMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport error types. All of these are treated as transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("No acknowledgment within {0}ms")]
    AckTimeout(u64),

    #[error("Invalid acknowledgment: {0}")]
    InvalidAck(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("File sink error: {0}")]
    File(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Result of a single delivery that reached the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Positive acknowledgment (or durable file write)
    Delivered,
    /// Explicit negative acknowledgment; not retried
    Rejected { reason: String },
}

/// Destination for observation messages
#[async_trait]
pub trait MessageSink: Send {
    /// Deliver one message. One call is one attempt; no retries here.
    async fn deliver(&mut self, message: &ObservationMessage) -> Result<Delivery, TransportError>;

    /// Release connections or handles
    async fn close(&mut self) {}

    /// Destination name for logs and events
    fn describe(&self) -> String;
}

#[async_trait]
impl MessageSink for Box<dyn MessageSink> {
    async fn deliver(&mut self, message: &ObservationMessage) -> Result<Delivery, TransportError> {
        (**self).deliver(message).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Which sink the bridge delivers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SinkConfig {
    Mllp(MllpConfig),
    File(FileSinkConfig),
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::File(FileSinkConfig::default())
    }
}

impl SinkConfig {
    /// Build the configured sink
    pub fn build(&self) -> Box<dyn MessageSink> {
        match self {
            SinkConfig::Mllp(config) => Box::new(MllpSink::new(config.clone())),
            SinkConfig::File(config) => Box::new(FileSink::new(config.clone())),
        }
    }

    /// Check settings before start
    pub fn validate(&self) -> Result<(), String> {
        match self {
            SinkConfig::Mllp(config) => config.validate(),
            SinkConfig::File(config) => config.validate(),
        }
    }
}
