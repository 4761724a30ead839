//! MLLP Network Sink
//!
//! Messages are framed as `VT message FS CR` on a persistent TCP
//! connection. After each message the receiver must answer within the
//! acknowledgment timeout with either a single ACK/NAK byte or an MLLP
//! framed HL7 `ACK` message.

use crate::{Delivery, MessageSink, TransportError};
use async_trait::async_trait;
use hl7_encoder::ObservationMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Block start
const VT: u8 = 0x0B;
/// Block end
const FS: u8 = 0x1C;
const CR: u8 = 0x0D;
const LF: u8 = 0x0A;
/// Single-byte positive acknowledgment
const ACK: u8 = 0x06;
/// Single-byte negative acknowledgment
const NAK: u8 = 0x15;

/// Largest reply we are willing to buffer
const MAX_REPLY_LEN: usize = 64 * 1024;

/// MLLP connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MllpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How long to wait for ACK/NAK after a message is written
    pub ack_timeout_ms: u64,
}

impl Default for MllpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2575,
            connect_timeout_ms: 5000,
            write_timeout_ms: 5000,
            ack_timeout_ms: 10_000,
        }
    }
}

impl MllpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("MLLP host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("MLLP port must be greater than zero".to_string());
        }
        if self.connect_timeout_ms == 0 || self.write_timeout_ms == 0 || self.ack_timeout_ms == 0 {
            return Err("MLLP timeouts must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Wrap an encoded message in MLLP block characters
pub fn frame_message(encoded: &str) -> Vec<u8> {
    let mut framed = Vec::with_capacity(encoded.len() + 3);
    framed.push(VT);
    framed.extend_from_slice(encoded.as_bytes());
    framed.push(FS);
    framed.push(CR);
    framed
}

/// Try to interpret buffered reply bytes.
///
/// Returns `Ok(None)` while more bytes are needed.
pub fn parse_reply(bytes: &[u8], control_id: u64) -> Result<Option<Delivery>, TransportError> {
    // Trailing CR/LF from a previous reply may still be in the stream
    let start = bytes.iter().position(|b| *b != CR && *b != LF);
    let Some(start) = start else {
        return Ok(None);
    };
    let bytes = &bytes[start..];

    match bytes[0] {
        ACK => Ok(Some(Delivery::Delivered)),
        NAK => Ok(Some(Delivery::Rejected {
            reason: "negative acknowledgment".to_string(),
        })),
        VT => match bytes.iter().position(|b| *b == FS) {
            Some(end) => {
                let text = String::from_utf8_lossy(&bytes[1..end]);
                parse_ack_message(&text, control_id).map(Some)
            }
            None => Ok(None),
        },
        other => Err(TransportError::InvalidAck(format!(
            "unexpected leading byte {:#04x}",
            other
        ))),
    }
}

/// Read MSA-1 (and MSA-2/MSA-3) from an HL7 ACK message
fn parse_ack_message(text: &str, control_id: u64) -> Result<Delivery, TransportError> {
    let msa = text
        .split(|c| c == '\r' || c == '\n')
        .find(|segment| segment.starts_with("MSA|"))
        .ok_or_else(|| TransportError::InvalidAck("no MSA segment".to_string()))?;

    let fields: Vec<&str> = msa.split('|').collect();
    let code = fields.get(1).copied().unwrap_or_default();

    if let Some(acked_id) = fields.get(2).filter(|id| !id.is_empty()) {
        if *acked_id != control_id.to_string() {
            return Err(TransportError::InvalidAck(format!(
                "acknowledged control ID {} but sent {}",
                acked_id, control_id
            )));
        }
    }

    match code {
        "AA" | "CA" => Ok(Delivery::Delivered),
        "AE" | "AR" | "CE" | "CR" => {
            let detail = fields.get(3).copied().unwrap_or_default();
            Ok(Delivery::Rejected {
                reason: if detail.is_empty() {
                    code.to_string()
                } else {
                    format!("{}: {}", code, detail)
                },
            })
        }
        other => Err(TransportError::InvalidAck(format!(
            "unknown acknowledgment code '{}'",
            other
        ))),
    }
}

/// Sink that keeps one TCP connection open to the receiver
pub struct MllpSink {
    config: MllpConfig,
    stream: Option<TcpStream>,
}

impl MllpSink {
    pub fn new(config: MllpConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    /// Whether a connection is currently held
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connection(&mut self) -> Result<&mut TcpStream, TransportError> {
        if self.stream.is_none() {
            let addr = self.config.address();
            let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

            let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
                Err(_) => return Err(TransportError::ConnectTimeout(addr)),
                Ok(Err(e)) => {
                    return Err(TransportError::Connect {
                        addr,
                        reason: e.to_string(),
                    })
                }
                Ok(Ok(stream)) => stream,
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY: {}", e);
            }

            info!("Connected to HL7 receiver at {}", addr);
            self.stream = Some(stream);
        }

        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    async fn exchange(&mut self, framed: &[u8], control_id: u64) -> Result<Delivery, TransportError> {
        let write_timeout = Duration::from_millis(self.config.write_timeout_ms);
        let ack_timeout_ms = self.config.ack_timeout_ms;
        let stream = self.connection().await?;

        let write = async {
            stream.write_all(framed).await?;
            stream.flush().await
        };
        match timeout(write_timeout, write).await {
            Err(_) => return Err(TransportError::Io("write timed out".to_string())),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(())) => {}
        }

        match timeout(
            Duration::from_millis(ack_timeout_ms),
            read_reply(stream, control_id),
        )
        .await
        {
            Err(_) => Err(TransportError::AckTimeout(ack_timeout_ms)),
            Ok(result) => result,
        }
    }
}

async fn read_reply(stream: &mut TcpStream, control_id: u64) -> Result<Delivery, TransportError> {
    let mut reply = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        reply.extend_from_slice(&buf[..n]);

        if let Some(delivery) = parse_reply(&reply, control_id)? {
            return Ok(delivery);
        }
        if reply.len() > MAX_REPLY_LEN {
            return Err(TransportError::InvalidAck("reply too large".to_string()));
        }
    }
}

#[async_trait]
impl MessageSink for MllpSink {
    async fn deliver(&mut self, message: &ObservationMessage) -> Result<Delivery, TransportError> {
        let framed = frame_message(&message.encode());
        let result = self.exchange(&framed, message.control_id).await;

        if let Err(e) = &result {
            // The connection state is unknown after any failure
            warn!("MLLP delivery of message {} failed: {}", message.control_id, e);
            self.stream = None;
        }
        result
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error shutting down MLLP connection: {}", e);
            }
            info!("Closed connection to {}", self.config.address());
        }
    }

    fn describe(&self) -> String {
        format!("mllp://{}", self.config.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hl7_encoder::{MapperConfig, ObservationMapper};
    use tokio::net::TcpListener;
    use vent_protocol::{ParameterCode, ParameterSnapshot, ParameterValue, RecordType};

    fn message() -> ObservationMessage {
        let mut snapshot = ParameterSnapshot::new(Utc::now(), RecordType::MixedMode);
        snapshot.insert(ParameterCode::Peep, ParameterValue::Numeric(5.0));
        ObservationMapper::new(MapperConfig::default()).map(&snapshot)
    }

    fn ack(code: &str, control_id: u64) -> Vec<u8> {
        frame_message(&format!(
            "MSH|^~\\&|HIS||HAMILTON_VENT||20240101000000||ACK|9|P|2.4\rMSA|{}|{}|detail\r",
            code, control_id
        ))
    }

    /// Accept one connection, read one framed message, answer with `reply`
    async fn one_shot_server(reply: Option<Vec<u8>>) -> (MllpConfig, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while !received.ends_with(&[FS, CR]) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            if let Some(reply) = reply {
                socket.write_all(&reply).await.unwrap();
            }
            // Hold the socket open long enough for timeout tests
            tokio::time::sleep(Duration::from_millis(300)).await;
            received
        });

        let config = MllpConfig {
            host: "127.0.0.1".to_string(),
            port,
            ack_timeout_ms: 100,
            ..Default::default()
        };
        (config, handle)
    }

    #[test]
    fn test_parse_single_byte_replies() {
        assert_eq!(parse_reply(&[ACK], 1).unwrap(), Some(Delivery::Delivered));
        assert!(matches!(
            parse_reply(&[NAK], 1).unwrap(),
            Some(Delivery::Rejected { .. })
        ));
        assert_eq!(parse_reply(&[], 1).unwrap(), None);
        assert!(parse_reply(b"x", 1).is_err());
    }

    #[test]
    fn test_parse_partial_hl7_ack_waits() {
        let full = ack("AA", 7);
        assert_eq!(parse_reply(&full[..10], 7).unwrap(), None);
        assert_eq!(parse_reply(&full, 7).unwrap(), Some(Delivery::Delivered));
    }

    #[test]
    fn test_parse_rejection_codes() {
        assert_eq!(
            parse_reply(&ack("AR", 3), 3).unwrap(),
            Some(Delivery::Rejected {
                reason: "AR: detail".to_string()
            })
        );
        assert!(matches!(
            parse_reply(&ack("AE", 3), 3).unwrap(),
            Some(Delivery::Rejected { .. })
        ));
    }

    #[test]
    fn test_parse_mismatched_control_id() {
        assert!(matches!(
            parse_reply(&ack("AA", 4), 5),
            Err(TransportError::InvalidAck(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_with_hl7_ack() {
        let msg = message();
        let (config, server) = one_shot_server(Some(ack("AA", msg.control_id))).await;
        let mut sink = MllpSink::new(config);

        assert_eq!(sink.deliver(&msg).await.unwrap(), Delivery::Delivered);
        assert!(sink.is_connected());

        let received = server.await.unwrap();
        assert_eq!(received[0], VT);
        assert!(received.ends_with(&[FS, CR]));
        assert!(String::from_utf8_lossy(&received).contains("OBX|1|NM|3005-4^PEEP||5.0|cmH2O"));
    }

    #[tokio::test]
    async fn test_deliver_nak_is_rejected() {
        let (config, _server) = one_shot_server(Some(vec![NAK])).await;
        let mut sink = MllpSink::new(config);
        assert!(matches!(
            sink.deliver(&message()).await.unwrap(),
            Delivery::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_ack_times_out_and_drops_connection() {
        let (config, _server) = one_shot_server(None).await;
        let mut sink = MllpSink::new(config);

        assert_eq!(
            sink.deliver(&message()).await,
            Err(TransportError::AckTimeout(100))
        );
        assert!(!sink.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut sink = MllpSink::new(MllpConfig {
            port,
            ..Default::default()
        });
        assert!(matches!(
            sink.deliver(&message()).await,
            Err(TransportError::Connect { .. })
        ));
    }
}
