//! HL7 Observation Encoding
//!
//! Converts decoded ventilator snapshots into HL7 v2.4 `ORU^R01`
//! messages: one MSH/PID/ORC/OBR header block followed by one OBX per
//! mapped parameter.

mod codes;
mod mapper;
mod message;

pub use codes::{observation_code, ObservationCode, ValueFormat};
pub use mapper::{ControlIdSequence, MapperConfig, ObservationMapper};
pub use message::{
    escape, format_timestamp, MessageHeader, ObservationEntry, ObservationMessage, ValueType,
};

/// HL7 version written to MSH-12
pub const HL7_VERSION: &str = "2.4";

/// Segment terminator
pub const SEGMENT_SEPARATOR: char = '\r';
