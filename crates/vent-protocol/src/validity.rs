//! Plausibility Ranges for Decoded Parameters
//!
//! Values outside these ranges are still decoded; the decoder only marks
//! them invalid so downstream stages can decide what to do.

use crate::record::ParameterCode;
use serde::{Deserialize, Serialize};

/// Valid range per parameter family (inclusive)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidityRanges {
    /// Airway pressures: Pmax, Pplateau, Pmean, PEEP, Pmin (cmH2O)
    pub pressure_cmh2o: (f64, f64),
    /// Expired tidal volume (mL)
    pub tidal_volume_ml: (f64, f64),
    /// Expired minute volume (L/min)
    pub minute_volume_l: (f64, f64),
    /// Total respiratory rate (breaths/min)
    pub resp_rate: (f64, f64),
    /// Oxygen concentration (%)
    pub fio2_percent: (f64, f64),
    /// Pulse oximetry saturation (%)
    pub spo2_percent: (f64, f64),
    /// Pulse rate (beats/min)
    pub pulse_bpm: (f64, f64),
    /// Static compliance (mL/cmH2O)
    pub compliance: (f64, f64),
}

impl Default for ValidityRanges {
    fn default() -> Self {
        Self {
            pressure_cmh2o: (-20.0, 120.0),
            tidal_volume_ml: (0.0, 4000.0),
            minute_volume_l: (0.0, 100.0),
            resp_rate: (0.0, 150.0),
            fio2_percent: (21.0, 100.0),
            spo2_percent: (0.0, 100.0),
            pulse_bpm: (0.0, 350.0),
            compliance: (0.0, 500.0),
        }
    }
}

impl ValidityRanges {
    /// Range that applies to `code`, if it has one
    pub fn range_for(&self, code: ParameterCode) -> Option<(f64, f64)> {
        match code {
            ParameterCode::PeakPressure
            | ParameterCode::PlateauPressure
            | ParameterCode::MeanPressure
            | ParameterCode::Peep
            | ParameterCode::MinPressure => Some(self.pressure_cmh2o),
            ParameterCode::TidalVolume => Some(self.tidal_volume_ml),
            ParameterCode::MinuteVolume => Some(self.minute_volume_l),
            ParameterCode::RespRate => Some(self.resp_rate),
            ParameterCode::FiO2 => Some(self.fio2_percent),
            ParameterCode::SpO2 => Some(self.spo2_percent),
            ParameterCode::Pulse => Some(self.pulse_bpm),
            ParameterCode::Compliance => Some(self.compliance),
            ParameterCode::BreathNumber => Some((0.0, f64::MAX)),
            ParameterCode::IeRatio
            | ParameterCode::VentilationMode
            | ParameterCode::Unknown { .. } => None,
        }
    }

    /// Whether `value` is plausible for `code`; codes without a range always pass
    pub fn contains(&self, code: ParameterCode, value: f64) -> bool {
        match self.range_for(code) {
            Some((min, max)) => value >= min && value <= max,
            None => true,
        }
    }
}
