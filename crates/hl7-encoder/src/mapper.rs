//! Observation Mapper
//!
//! Turns a [`ParameterSnapshot`] into an [`ObservationMessage`]. Absent and
//! invalid parameters are left out; every message gets a fresh control ID.

use crate::codes::{observation_code, ValueFormat};
use crate::message::{MessageHeader, ObservationEntry, ObservationMessage, ValueType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use vent_protocol::{ParameterSnapshot, ParameterValue};

/// Identification fields written into every message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// MSH-3
    pub sending_application: String,
    /// MSH-4
    pub sending_facility: String,
    /// MSH-5
    pub receiving_application: String,
    /// MSH-6
    pub receiving_facility: String,
    /// MSH-11 (P = production, T = training, D = debugging)
    pub processing_id: String,
    /// PID-3 of the ventilated patient
    pub patient_id: String,
    /// ORC-21
    pub device_name: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            sending_application: "HAMILTON_VENT".to_string(),
            sending_facility: String::new(),
            receiving_application: String::new(),
            receiving_facility: String::new(),
            processing_id: "P".to_string(),
            patient_id: "PATIENT_12345".to_string(),
            device_name: "Hamilton_Ventilator".to_string(),
        }
    }
}

/// Source of message control IDs; strictly increasing, never reused
#[derive(Debug)]
pub struct ControlIdSequence {
    next: AtomicU64,
}

impl ControlIdSequence {
    /// Start issuing IDs at `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Take the next ID
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The ID the next call will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for ControlIdSequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Snapshot to HL7 mapper
pub struct ObservationMapper {
    config: MapperConfig,
    ids: ControlIdSequence,
}

impl ObservationMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self::with_sequence(config, ControlIdSequence::default())
    }

    pub fn with_sequence(config: MapperConfig, ids: ControlIdSequence) -> Self {
        Self { config, ids }
    }

    /// Map a snapshot, stamping the message with the current time
    pub fn map(&self, snapshot: &ParameterSnapshot) -> ObservationMessage {
        self.map_at(snapshot, Utc::now())
    }

    /// Map a snapshot with an explicit creation time
    pub fn map_at(&self, snapshot: &ParameterSnapshot, created_at: DateTime<Utc>) -> ObservationMessage {
        let entries = observations(snapshot);
        let control_id = self.ids.next_id();
        debug!(
            "Mapped snapshot to message {} with {} observations",
            control_id,
            entries.len()
        );

        ObservationMessage {
            control_id,
            created_at,
            header: MessageHeader {
                sending_application: self.config.sending_application.clone(),
                sending_facility: self.config.sending_facility.clone(),
                receiving_application: self.config.receiving_application.clone(),
                receiving_facility: self.config.receiving_facility.clone(),
                processing_id: self.config.processing_id.clone(),
            },
            patient_id: self.config.patient_id.clone(),
            device_name: self.config.device_name.clone(),
            observed_at: snapshot.captured_at,
            entries,
        }
    }

    /// Whether mapping `snapshot` would produce at least one OBX.
    ///
    /// Does not consume a control ID.
    pub fn has_observations(&self, snapshot: &ParameterSnapshot) -> bool {
        !observations(snapshot).is_empty()
    }

    /// Control ID the next mapped message will carry
    pub fn next_control_id(&self) -> u64 {
        self.ids.peek()
    }
}

fn observations(snapshot: &ParameterSnapshot) -> Vec<ObservationEntry> {
    let mut entries = Vec::new();

    for (&parameter, value) in snapshot.values() {
        if !snapshot.is_valid(parameter) {
            continue;
        }
        let Some(code) = observation_code(parameter) else {
            continue;
        };
        let Some((value_type, formatted)) = format_value(value, code.format) else {
            continue;
        };

        entries.push(ObservationEntry {
            set_id: entries.len() + 1,
            parameter,
            identifier: code.identifier,
            text: code.text,
            value_type,
            value: formatted,
            unit: code.unit,
            observed_at: snapshot.captured_at,
        });
    }

    entries
}

fn format_value(value: &ParameterValue, format: ValueFormat) -> Option<(ValueType, String)> {
    match (value, format) {
        (ParameterValue::Numeric(v), ValueFormat::Fixed(precision)) => {
            Some((ValueType::Nm, format!("{:.*}", precision, v)))
        }
        (ParameterValue::Numeric(v), ValueFormat::Text) => Some((ValueType::St, v.to_string())),
        (ParameterValue::Text(s), ValueFormat::Text) => Some((ValueType::St, s.clone())),
        // A numeric parameter that arrived as text is never valid
        (ParameterValue::Text(_), ValueFormat::Fixed(_)) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vent_protocol::{ParameterCode, RecordType};

    fn snapshot(values: &[(ParameterCode, ParameterValue)]) -> ParameterSnapshot {
        let mut snapshot = ParameterSnapshot::new(Utc::now(), RecordType::MixedMode);
        for (code, value) in values {
            snapshot.insert(*code, value.clone());
        }
        snapshot
    }

    #[test]
    fn test_maps_three_core_parameters() {
        let mapper = ObservationMapper::new(MapperConfig::default());
        let snap = snapshot(&[
            (ParameterCode::FiO2, ParameterValue::Numeric(40.0)),
            (ParameterCode::Peep, ParameterValue::Numeric(5.0)),
            (ParameterCode::TidalVolume, ParameterValue::Numeric(450.0)),
        ]);

        let message = mapper.map(&snap);
        let values: Vec<(&str, &str, &str)> = message
            .entries
            .iter()
            .map(|e| (e.identifier, e.value.as_str(), e.unit))
            .collect();

        // Ordered by parameter code, not insertion order
        assert_eq!(
            values,
            vec![
                ("3005-4", "5.0", "cmH2O"),
                ("LP73863-0", "450", "mL"),
                ("3008-7", "40", "%"),
            ]
        );
        assert_eq!(message.entries[2].set_id, 3);
        assert_eq!(message.observed_at, snap.captured_at);
    }

    #[test]
    fn test_control_ids_strictly_increase() {
        let mapper = ObservationMapper::new(MapperConfig::default());
        let snap = snapshot(&[(ParameterCode::Peep, ParameterValue::Numeric(5.0))]);

        let ids: Vec<u64> = (0..5).map(|_| mapper.map(&snap).control_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(mapper.next_control_id(), 6);
    }

    #[test]
    fn test_invalid_and_unmapped_omitted() {
        let mapper = ObservationMapper::new(MapperConfig::default());
        let mut snap = snapshot(&[
            (ParameterCode::BreathNumber, ParameterValue::Numeric(12.0)),
            (ParameterCode::Unknown { group: 0x60, id: 2 }, ParameterValue::Text("ALARM".into())),
            (ParameterCode::VentilationMode, ParameterValue::Text("SIMV".into())),
        ]);
        snap.insert_invalid(ParameterCode::TidalVolume, ParameterValue::Numeric(-3.0));

        let message = mapper.map(&snap);
        assert_eq!(message.len(), 1);
        assert_eq!(message.entries[0].value_type, ValueType::St);
        assert_eq!(message.entries[0].value, "SIMV");
    }

    #[test]
    fn test_empty_snapshot_still_gets_id() {
        let mapper = ObservationMapper::with_sequence(
            MapperConfig::default(),
            ControlIdSequence::starting_at(100),
        );
        let message = mapper.map(&snapshot(&[]));
        assert!(message.is_empty());
        assert_eq!(message.control_id, 100);
    }

    #[test]
    fn test_fixed_precision_formatting() {
        let mapper = ObservationMapper::new(MapperConfig::default());
        let snap = snapshot(&[
            (ParameterCode::MinuteVolume, ParameterValue::Numeric(7.456)),
            (ParameterCode::PeakPressure, ParameterValue::Numeric(22.04)),
        ]);
        let message = mapper.map(&snap);
        let values: Vec<&str> = message.entries.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["22.0", "7.46"]);
    }

    #[test]
    fn test_has_observations_does_not_consume_id() {
        let mapper = ObservationMapper::new(MapperConfig::default());
        let unmapped = snapshot(&[(ParameterCode::BreathNumber, ParameterValue::Numeric(12.0))]);
        let mapped = snapshot(&[(ParameterCode::Peep, ParameterValue::Numeric(5.0))]);

        assert!(!mapper.has_observations(&unmapped));
        assert!(mapper.has_observations(&mapped));
        assert_eq!(mapper.next_control_id(), 1);
    }
}
