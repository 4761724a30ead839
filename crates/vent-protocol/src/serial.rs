//! Serial Link to the Ventilator
//!
//! Opens the device port with `tokio-serial`. The coordinator only sees the
//! [`LinkOpener`] trait so tests can substitute in-memory links.

use crate::error::ProtocolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

/// Default baud rate of the ventilator's COM interface
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    pub baud_rate: u32,
    /// 7 or 8
    pub data_bits: u8,
    pub parity: Parity,
    /// 1 or 2
    pub stop_bits: u8,
    /// Longest wait for bytes before the reader reports the link idle
    pub read_timeout_ms: u64,
    /// Longest wait for a command write to complete
    pub write_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            read_timeout_ms: 100,
            write_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Check settings before any port is opened
    pub fn validate(&self) -> Result<(), String> {
        if self.port.is_empty() {
            return Err("serial port path cannot be empty".to_string());
        }
        if self.baud_rate == 0 {
            return Err("baud rate must be greater than zero".to_string());
        }
        if ![7, 8].contains(&self.data_bits) {
            return Err("data bits must be 7 or 8".to_string());
        }
        if ![1, 2].contains(&self.stop_bits) {
            return Err("stop bits must be 1 or 2".to_string());
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err("serial timeouts must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Something that can (re)open the link to the ventilator
#[async_trait]
pub trait LinkOpener: Send + Sync {
    type Link: AsyncRead + AsyncWrite + Unpin + Send;

    /// Open a fresh link; called again after every loss
    async fn open(&self) -> Result<Self::Link, ProtocolError>;

    /// Human-readable link name for logs and events
    fn describe(&self) -> String;
}

/// Opens a real serial port
#[derive(Debug, Clone)]
pub struct SerialOpener {
    config: SerialConfig,
}

impl SerialOpener {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkOpener for SerialOpener {
    type Link = SerialStream;

    async fn open(&self) -> Result<SerialStream, ProtocolError> {
        let config = &self.config;
        info!(
            "Opening serial port {} at {} baud ({}{:?}{})",
            config.port, config.baud_rate, config.data_bits, config.parity, config.stop_bits
        );

        let data_bits = match config.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .parity(config.parity.into())
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(config.read_timeout())
            .open_native_async()
            .map_err(|e| ProtocolError::OpenFailed {
                port: config.port.clone(),
                reason: e.to_string(),
            })?;

        debug!("Serial port {} open", config.port);
        Ok(stream)
    }

    fn describe(&self) -> String {
        self.config.port.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_device() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.parity, Parity::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SerialConfig {
            stop_bits: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SerialConfig {
            port: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let opener = SerialOpener::new(SerialConfig {
            port: "/dev/does-not-exist-vent".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            opener.open().await,
            Err(ProtocolError::OpenFailed { .. })
        ));
    }
}
