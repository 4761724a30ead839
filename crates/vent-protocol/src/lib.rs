//! Hamilton Ventilator Serial Protocol
//!
//! This crate turns the raw byte stream of a Hamilton-class ventilator's
//! serial interface into typed parameter snapshots. It covers frame
//! resynchronization and CRC-8 validation, record decoding, validity
//! ranges, the device activation command and the serial link itself.

mod command;
mod error;
mod frame;
mod record;
mod serial;
mod validity;

pub use command::{activate_mixed_mode, DataGroup, SendMode};
pub use error::{DecodeError, ProtocolError};
pub use frame::{crc8, CorruptionReason, FrameCorruption, FrameReader, RawFrame, ReadOutcome};
pub use record::{decode, decode_with, ParameterCode, ParameterSnapshot, ParameterValue, RecordType};
pub use serial::{LinkOpener, Parity, SerialConfig, SerialOpener};
pub use validity::ValidityRanges;

/// Version of the byte-level framing contract implemented by [`FrameReader`].
///
/// Bump whenever markers, checksum or body layout handling change.
pub const FRAMING_VERSION: u32 = 1;

/// Largest frame (STX through CR) the reader will accumulate
pub const MAX_FRAME_LEN: usize = 1024;

/// Control characters used by the device framing
pub mod control {
    /// Start of frame
    pub const STX: u8 = 0x02;
    /// End of body, checksum follows
    pub const ETX: u8 = 0x03;
    /// Parameter separator inside the body
    pub const VT: u8 = 0x0B;
    /// End of frame
    pub const CR: u8 = 0x0D;
}
