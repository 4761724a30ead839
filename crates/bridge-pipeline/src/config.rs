//! Bridge Configuration

use crate::emission::EmitPolicy;
use hl7_encoder::MapperConfig;
use hl7_transport::{ExponentialBackoff, RetryPolicy, SinkConfig, DEFAULT_SHUTDOWN_GRACE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use vent_protocol::{SerialConfig, ValidityRanges};

/// Configuration rejected before start
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {section} configuration: {reason}")]
    Invalid { section: &'static str, reason: String },
}

fn invalid(section: &'static str) -> impl Fn(String) -> ConfigError {
    move |reason| ConfigError::Invalid { section, reason }
}

/// Delays between serial reopen attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10_000,
            max_delay_ms: 120_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
            self.jitter,
        )
    }
}

/// Everything the bridge needs to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub sink: SinkConfig,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    pub mapper: MapperConfig,
    pub validity: ValidityRanges,
    pub emit: EmitPolicy,
    /// Messages held for redelivery while sending is degraded
    pub queue_capacity: usize,
    /// Resend period of the activation command while connected
    pub activation_interval_ms: u64,
    /// How often queued messages are retried while degraded
    pub redelivery_interval_ms: u64,
    /// Silence after which a `LinkIdle` event is reported
    pub idle_report_ms: u64,
    /// Time an in-flight send may keep running after shutdown is requested
    pub shutdown_grace_ms: u64,
    /// Buffered events per subscriber
    pub event_capacity: usize,
    /// tracing level filter for the binary
    pub log_level: String,
    /// JSON log lines instead of plain text
    pub log_json: bool,
    /// Prometheus listen address, e.g. "0.0.0.0:9100"
    pub metrics_listen: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            sink: SinkConfig::default(),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            mapper: MapperConfig::default(),
            validity: ValidityRanges::default(),
            emit: EmitPolicy::default(),
            queue_capacity: ring_buffer::DEFAULT_CAPACITY,
            activation_interval_ms: 30_000,
            redelivery_interval_ms: 5_000,
            idle_report_ms: 10_000,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE.as_millis() as u64,
            event_capacity: 256,
            log_level: "info".to_string(),
            log_json: false,
            metrics_listen: None,
        }
    }
}

impl BridgeConfig {
    /// Check every section; the first problem found is returned
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.serial.validate().map_err(invalid("serial"))?;
        self.sink.validate().map_err(invalid("sink"))?;
        self.retry.validate().map_err(invalid("retry"))?;

        if self.reconnect.initial_delay_ms == 0 {
            return Err(invalid("reconnect")("initial_delay_ms must be greater than zero".to_string()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(invalid("reconnect")("max_delay_ms must not be below initial_delay_ms".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue")("queue_capacity must be greater than zero".to_string()));
        }
        if self.activation_interval_ms == 0 || self.redelivery_interval_ms == 0 || self.idle_report_ms == 0 {
            return Err(invalid("timing")("intervals must be greater than zero".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(invalid("events")("event_capacity must be greater than zero".to_string()));
        }
        if self.mapper.patient_id.is_empty() {
            return Err(invalid("mapper")("patient_id cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn activation_interval(&self) -> Duration {
        Duration::from_millis(self.activation_interval_ms)
    }

    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_millis(self.redelivery_interval_ms)
    }

    pub fn idle_report(&self) -> Duration {
        Duration::from_millis(self.idle_report_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
