//! Parameter Records and Decoding
//!
//! A data frame body looks like
//!
//! ```text
//! record type | header ... | VT | grp id value | VT | grp id value | ...
//! ```
//!
//! where each parameter chunk is a group ID byte, a parameter ID byte and
//! an ASCII value. Parameter ID 0xFF marks the end of a group.

use crate::command::CMD_ACTIVATE_MIXED_MODE;
use crate::control::VT;
use crate::error::DecodeError;
use crate::frame::RawFrame;
use crate::validity::ValidityRanges;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Parameter ID that terminates a group
const GROUP_END: u8 = 0xFF;

const GROUP_MONITORED: u8 = 0x50;
const GROUP_CONTROL: u8 = 0x70;

/// Ventilator parameters the bridge understands.
///
/// Ordering of the variants is the ordering of observations in outgoing
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParameterCode {
    /// Breath counter (0x50/0x20)
    BreathNumber,
    /// Peak airway pressure (0x50/0x21)
    PeakPressure,
    /// Plateau pressure (0x50/0x22)
    PlateauPressure,
    /// Mean airway pressure (0x50/0x23)
    MeanPressure,
    /// PEEP/CPAP (0x50/0x24)
    Peep,
    /// Minimum airway pressure (0x50/0x25)
    MinPressure,
    /// Expired tidal volume (0x50/0x2C)
    TidalVolume,
    /// Expired minute volume (0x50/0x2E)
    MinuteVolume,
    /// Total respiratory rate (0x50/0x30)
    RespRate,
    /// I:E ratio (0x50/0x34)
    IeRatio,
    /// Static compliance (0x50/0x37)
    Compliance,
    /// Oxygen concentration (0x50/0x3E)
    FiO2,
    /// Pulse rate (0x50/0x4E)
    Pulse,
    /// Oxygen saturation (0x50/0x4F)
    SpO2,
    /// Ventilation mode name (0x70/0x22)
    VentilationMode,
    /// Anything else; kept for forward compatibility, never mapped
    Unknown { group: u8, id: u8 },
}

impl ParameterCode {
    /// Map a (group, parameter) pair from the wire to a code
    pub fn from_wire(group: u8, id: u8) -> Self {
        match (group, id) {
            (GROUP_MONITORED, 0x20) => ParameterCode::BreathNumber,
            (GROUP_MONITORED, 0x21) => ParameterCode::PeakPressure,
            (GROUP_MONITORED, 0x22) => ParameterCode::PlateauPressure,
            (GROUP_MONITORED, 0x23) => ParameterCode::MeanPressure,
            (GROUP_MONITORED, 0x24) => ParameterCode::Peep,
            (GROUP_MONITORED, 0x25) => ParameterCode::MinPressure,
            (GROUP_MONITORED, 0x2C) => ParameterCode::TidalVolume,
            (GROUP_MONITORED, 0x2E) => ParameterCode::MinuteVolume,
            (GROUP_MONITORED, 0x30) => ParameterCode::RespRate,
            (GROUP_MONITORED, 0x34) => ParameterCode::IeRatio,
            (GROUP_MONITORED, 0x37) => ParameterCode::Compliance,
            (GROUP_MONITORED, 0x3E) => ParameterCode::FiO2,
            (GROUP_MONITORED, 0x4E) => ParameterCode::Pulse,
            (GROUP_MONITORED, 0x4F) => ParameterCode::SpO2,
            (GROUP_CONTROL, 0x22) => ParameterCode::VentilationMode,
            (group, id) => ParameterCode::Unknown { group, id },
        }
    }

    /// Whether the device sends this parameter as a number
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            ParameterCode::IeRatio | ParameterCode::VentilationMode | ParameterCode::Unknown { .. }
        )
    }

    /// Name as shown on the ventilator display
    pub fn device_name(&self) -> &'static str {
        match self {
            ParameterCode::BreathNumber => "Breath Number",
            ParameterCode::PeakPressure => "P max",
            ParameterCode::PlateauPressure => "P Plateau",
            ParameterCode::MeanPressure => "P mean",
            ParameterCode::Peep => "PEEP/CPAP",
            ParameterCode::MinPressure => "P min",
            ParameterCode::TidalVolume => "Exp. Volume",
            ParameterCode::MinuteVolume => "Vexp/min",
            ParameterCode::RespRate => "f total",
            ParameterCode::IeRatio => "I:E ratio",
            ParameterCode::Compliance => "Compliance",
            ParameterCode::FiO2 => "Oxygen",
            ParameterCode::Pulse => "Pulse",
            ParameterCode::SpO2 => "SpO2",
            ParameterCode::VentilationMode => "Mode Name",
            ParameterCode::Unknown { .. } => "Unknown",
        }
    }
}

/// A decoded parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Numeric(f64),
    Text(String),
}

impl ParameterValue {
    /// Numeric value, if this is one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Numeric(v) => Some(*v),
            ParameterValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Numeric(v) => write!(f, "{}", v),
            ParameterValue::Text(s) => f.write_str(s),
        }
    }
}

/// Record types carried in the first body byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    /// Response to "Activate Mixed Mode": grouped parameter values
    MixedMode,
}

impl RecordType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            CMD_ACTIVATE_MIXED_MODE => Some(RecordType::MixedMode),
            _ => None,
        }
    }
}

/// Timestamped set of parameter values decoded from one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    /// When the frame carrying these values was received
    pub captured_at: DateTime<Utc>,
    pub record_type: RecordType,
    values: BTreeMap<ParameterCode, ParameterValue>,
    /// Codes whose value failed parsing or range checks
    invalid: BTreeSet<ParameterCode>,
}

impl ParameterSnapshot {
    /// Create an empty snapshot
    pub fn new(captured_at: DateTime<Utc>, record_type: RecordType) -> Self {
        Self {
            captured_at,
            record_type,
            values: BTreeMap::new(),
            invalid: BTreeSet::new(),
        }
    }

    /// Set a value, clearing any previous invalid flag for the code
    pub fn insert(&mut self, code: ParameterCode, value: ParameterValue) {
        self.invalid.remove(&code);
        self.values.insert(code, value);
    }

    /// Set a value and mark it invalid
    pub fn insert_invalid(&mut self, code: ParameterCode, value: ParameterValue) {
        self.values.insert(code, value);
        self.invalid.insert(code);
    }

    pub fn get(&self, code: ParameterCode) -> Option<&ParameterValue> {
        self.values.get(&code)
    }

    /// True when the code is present and not flagged
    pub fn is_valid(&self, code: ParameterCode) -> bool {
        self.values.contains_key(&code) && !self.invalid.contains(&code)
    }

    /// All values in parameter-code order
    pub fn values(&self) -> impl Iterator<Item = (&ParameterCode, &ParameterValue)> {
        self.values.iter()
    }

    /// Codes flagged invalid
    pub fn invalid(&self) -> impl Iterator<Item = &ParameterCode> {
        self.invalid.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overlay a newer snapshot onto this one (values and flags from `newer` win)
    pub fn merge(&mut self, newer: &ParameterSnapshot) {
        for (code, value) in &newer.values {
            if newer.invalid.contains(code) {
                self.insert_invalid(*code, value.clone());
            } else {
                self.insert(*code, value.clone());
            }
        }
        if newer.captured_at > self.captured_at {
            self.captured_at = newer.captured_at;
        }
    }
}

/// Decode a frame using the default validity ranges
pub fn decode(frame: &RawFrame) -> Result<ParameterSnapshot, DecodeError> {
    decode_with(frame, &ValidityRanges::default())
}

/// Decode a frame into a parameter snapshot.
///
/// Pure: the same frame and ranges always give the same snapshot.
pub fn decode_with(
    frame: &RawFrame,
    ranges: &ValidityRanges,
) -> Result<ParameterSnapshot, DecodeError> {
    let body = frame.body();
    let (&record_byte, rest) = body.split_first().ok_or(DecodeError::EmptyBody)?;
    let record_type =
        RecordType::from_byte(record_byte).ok_or(DecodeError::UnsupportedRecordType(record_byte))?;

    let vt_pos = rest
        .iter()
        .position(|&b| b == VT)
        .ok_or(DecodeError::MissingParameterBlock)?;

    let mut snapshot = ParameterSnapshot::new(frame.received_at(), record_type);
    // Offsets are relative to the body for error reporting
    let mut offset = 1 + vt_pos + 1;

    for chunk in rest[vt_pos + 1..].split(|&b| b == VT) {
        let chunk_offset = offset;
        offset += chunk.len() + 1;

        if chunk.is_empty() {
            continue;
        }
        if chunk.len() < 2 {
            return Err(DecodeError::MalformedParameter {
                offset: chunk_offset,
            });
        }

        let (group, id) = (chunk[0], chunk[1]);
        if id == GROUP_END {
            continue;
        }

        let text: String = chunk[2..]
            .iter()
            .filter(|b| b.is_ascii())
            .map(|&b| b as char)
            .collect();
        let text = text.trim();
        // Blank means the device has no value right now
        if text.is_empty() {
            continue;
        }

        decode_value(&mut snapshot, ParameterCode::from_wire(group, id), text, ranges);
    }

    Ok(snapshot)
}

fn decode_value(
    snapshot: &mut ParameterSnapshot,
    code: ParameterCode,
    text: &str,
    ranges: &ValidityRanges,
) {
    let parsed = text.parse::<f64>().ok().filter(|v| v.is_finite());

    match (code, parsed) {
        (ParameterCode::Unknown { .. }, Some(value)) => {
            snapshot.insert(code, ParameterValue::Numeric(value));
        }
        _ if !code.is_numeric() => {
            snapshot.insert(code, ParameterValue::Text(text.to_string()));
        }
        (_, Some(value)) if ranges.contains(code, value) => {
            snapshot.insert(code, ParameterValue::Numeric(value));
        }
        (_, Some(value)) => {
            snapshot.insert_invalid(code, ParameterValue::Numeric(value));
        }
        (_, None) => {
            snapshot.insert_invalid(code, ParameterValue::Text(text.to_string()));
        }
    }
}
