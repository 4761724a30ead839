//! Ventilator Protocol Error Types

use thiserror::Error;

/// Errors on the serial link itself
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serial port could not be opened
    #[error("Failed to open serial port {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    /// The link went away mid-session (unplugged cable, device power-off)
    #[error("Serial link lost: {0}")]
    LinkLost(String),

    /// Writing a command to the device failed
    #[error("Serial write failed: {0}")]
    WriteFailed(String),

    /// Write did not complete in time
    #[error("Timeout writing to serial link after {0}ms")]
    Timeout(u64),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::LinkLost(err.to_string())
    }
}

/// Per-record decoding failures. Never fatal for the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame body carries a record type this decoder does not know
    #[error("Unsupported record type {0:#04X}")]
    UnsupportedRecordType(u8),

    /// Frame has no body at all
    #[error("Empty frame body")]
    EmptyBody,

    /// Body lacks the VT that introduces the parameter block
    #[error("Missing parameter block")]
    MissingParameterBlock,

    /// Parameter chunk too short to hold group and parameter IDs
    #[error("Malformed parameter chunk at offset {offset}")]
    MalformedParameter { offset: usize },
}
