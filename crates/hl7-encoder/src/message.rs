//! HL7 Observation Message Model and Encoding

use crate::{HL7_VERSION, SEGMENT_SEPARATOR};
use chrono::{DateTime, Utc};
use vent_protocol::ParameterCode;

/// OBX-2 value type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Numeric
    Nm,
    /// String
    St,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Nm => "NM",
            ValueType::St => "ST",
        }
    }
}

/// One OBX segment
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationEntry {
    /// OBX-1, starting at 1
    pub set_id: usize,
    pub parameter: ParameterCode,
    pub identifier: &'static str,
    pub text: &'static str,
    pub value_type: ValueType,
    /// Already formatted OBX-5 value
    pub value: String,
    pub unit: &'static str,
    pub observed_at: DateTime<Utc>,
}

/// Routing fields shared by every message from this bridge
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub processing_id: String,
}

/// An `ORU^R01` observation result message
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationMessage {
    /// MSH-10; unique and increasing for the life of the process
    pub control_id: u64,
    /// MSH-7; wall-clock time the message was built
    pub created_at: DateTime<Utc>,
    pub header: MessageHeader,
    /// PID-3
    pub patient_id: String,
    /// ORC-21
    pub device_name: String,
    /// OBR-7; capture time of the underlying snapshot
    pub observed_at: DateTime<Utc>,
    /// OBX entries ordered by parameter code
    pub entries: Vec<ObservationEntry>,
}

impl ObservationMessage {
    /// Encode as pipe-delimited HL7 text, each segment terminated by CR
    pub fn encode(&self) -> String {
        let created = format_timestamp(&self.created_at);
        let observed = format_timestamp(&self.observed_at);
        let header = &self.header;

        let mut segments = Vec::with_capacity(4 + self.entries.len());
        segments.push(format!(
            "MSH|^~\\&|{}|{}|{}|{}|{}||ORU^R01^ORU_R01|{}|{}|{}",
            escape(&header.sending_application),
            escape(&header.sending_facility),
            escape(&header.receiving_application),
            escape(&header.receiving_facility),
            created,
            self.control_id,
            escape(&header.processing_id),
            HL7_VERSION,
        ));
        segments.push(format!("PID|||{}", escape(&self.patient_id)));
        // ORC-21 ordering facility name
        segments.push(format!("ORC|NW{}{}", "|".repeat(20), escape(&self.device_name)));
        segments.push(format!("OBR|1||||||{}", observed));

        for entry in &self.entries {
            segments.push(format!(
                "OBX|{}|{}|{}^{}||{}|{}|||||F|||{}",
                entry.set_id,
                entry.value_type.as_str(),
                entry.identifier,
                escape(entry.text),
                escape(&entry.value),
                escape(entry.unit),
                format_timestamp(&entry.observed_at),
            ));
        }

        let mut encoded = String::new();
        for segment in segments {
            encoded.push_str(&segment);
            encoded.push(SEGMENT_SEPARATOR);
        }
        encoded
    }

    /// Number of OBX entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// HL7 TS format, UTC with explicit offset
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H%M%S+0000").to_string()
}

/// Escape HL7 delimiter characters in a field value
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\E\\"),
            '|' => escaped.push_str("\\F\\"),
            '^' => escaped.push_str("\\S\\"),
            '&' => escaped.push_str("\\T\\"),
            '~' => escaped.push_str("\\R\\"),
            '\r' | '\n' => escaped.push(' '),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn header() -> MessageHeader {
        MessageHeader {
            sending_application: "HAMILTON_VENT".into(),
            sending_facility: String::new(),
            receiving_application: "HIS".into(),
            receiving_facility: "ICU".into(),
            processing_id: "P".into(),
        }
    }

    #[test]
    fn test_escape_delimiters() {
        assert_eq!(escape("a|b^c&d~e\\f"), "a\\F\\b\\S\\c\\T\\d\\R\\e\\E\\f");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn test_encode_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let message = ObservationMessage {
            control_id: 42,
            created_at: ts,
            header: header(),
            patient_id: "PATIENT_12345".into(),
            device_name: "Hamilton_Ventilator".into(),
            observed_at: ts,
            entries: vec![ObservationEntry {
                set_id: 1,
                parameter: ParameterCode::Peep,
                identifier: "3005-4",
                text: "PEEP",
                value_type: ValueType::Nm,
                value: "5.0".into(),
                unit: "cmH2O",
                observed_at: ts,
            }],
        };

        let encoded = message.encode();
        let segments: Vec<&str> = encoded.split('\r').collect();

        assert_eq!(
            segments[0],
            "MSH|^~\\&|HAMILTON_VENT||HIS|ICU|20240301123045+0000||ORU^R01^ORU_R01|42|P|2.4"
        );
        assert_eq!(segments[1], "PID|||PATIENT_12345");
        assert_eq!(segments[2].split('|').nth(21), Some("Hamilton_Ventilator"));
        assert_eq!(segments[3].split('|').nth(7), Some("20240301123045+0000"));
        assert_eq!(
            segments[4],
            "OBX|1|NM|3005-4^PEEP||5.0|cmH2O|||||F|||20240301123045+0000"
        );
        // Trailing CR after the last segment
        assert_eq!(segments.last(), Some(&""));
    }
}
