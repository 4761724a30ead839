//! Bridge Events and Health

use hl7_transport::DeliveryAttempt;
use serde::Serialize;
use vent_protocol::FrameCorruption;

/// Externally visible health of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Serial link open, messages going out
    Connected,
    /// No serial link
    Disconnected,
    /// Serial link open but messages are queued for redelivery
    SendDegraded,
}

/// One observable thing that happened in the pipeline.
///
/// Every non-success outcome produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Connected {
        link: String,
    },
    LinkOpenFailed {
        link: String,
        error: String,
        retry_in_ms: u64,
    },
    /// No frame for a while; once per silent stretch
    LinkIdle {
        silent_ms: u64,
    },
    LinkLost {
        reason: String,
        retry_in_ms: u64,
    },
    FrameCorruption {
        corruption: FrameCorruption,
    },
    UnsupportedRecordType {
        record_type: u8,
    },
    DecodeError {
        error: String,
    },
    MessageMapped {
        control_id: u64,
        observations: usize,
    },
    SendAttempt {
        attempt: DeliveryAttempt,
    },
    Delivered {
        control_id: u64,
        attempts: u32,
    },
    Rejected {
        control_id: u64,
        reason: String,
    },
    /// Retry budget exhausted; messages now queue for redelivery
    SendDegraded {
        control_id: u64,
        error: String,
    },
    SendRecovered {
        redelivered: usize,
    },
    /// Queue full; the oldest message was dropped
    QueueOverflow {
        dropped_control_id: u64,
        capacity: usize,
    },
    /// A message that will never be delivered
    DataLoss {
        control_id: u64,
        reason: String,
    },
    /// Final event; `drained` is false when shutdown reported any data loss
    Stopped {
        drained: bool,
    },
}

impl BridgeEvent {
    /// Short name used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::Connected { .. } => "connected",
            BridgeEvent::LinkOpenFailed { .. } => "link_open_failed",
            BridgeEvent::LinkIdle { .. } => "link_idle",
            BridgeEvent::LinkLost { .. } => "link_lost",
            BridgeEvent::FrameCorruption { .. } => "frame_corruption",
            BridgeEvent::UnsupportedRecordType { .. } => "unsupported_record_type",
            BridgeEvent::DecodeError { .. } => "decode_error",
            BridgeEvent::MessageMapped { .. } => "message_mapped",
            BridgeEvent::SendAttempt { .. } => "send_attempt",
            BridgeEvent::Delivered { .. } => "delivered",
            BridgeEvent::Rejected { .. } => "rejected",
            BridgeEvent::SendDegraded { .. } => "send_degraded",
            BridgeEvent::SendRecovered { .. } => "send_recovered",
            BridgeEvent::QueueOverflow { .. } => "queue_overflow",
            BridgeEvent::DataLoss { .. } => "data_loss",
            BridgeEvent::Stopped { .. } => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vent_protocol::CorruptionReason;

    #[test]
    fn test_event_json_shape() {
        let event = BridgeEvent::FrameCorruption {
            corruption: FrameCorruption {
                reason: CorruptionReason::ChecksumMismatch {
                    expected: 0x1B,
                    actual: 0x1C,
                },
                discarded: 17,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "frame_corruption");
        assert_eq!(json["corruption"]["reason"]["kind"], "checksum_mismatch");
        assert_eq!(json["corruption"]["discarded"], 17);
        assert_eq!(event.kind(), "frame_corruption");
    }

    #[test]
    fn test_health_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::SendDegraded).unwrap(),
            "\"send_degraded\""
        );
    }
}
