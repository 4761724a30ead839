//! Parameter to HL7 Observation Identifier Table

use vent_protocol::ParameterCode;

/// How a parameter value is written into OBX-5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    /// Numeric with a fixed number of decimals
    Fixed(usize),
    /// Passed through as text
    Text,
}

/// OBX identification for one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationCode {
    /// OBX-3 identifier (LOINC where one exists)
    pub identifier: &'static str,
    /// OBX-3 text component
    pub text: &'static str,
    /// OBX-6 units, empty for unitless values
    pub unit: &'static str,
    pub format: ValueFormat,
}

const fn code(
    identifier: &'static str,
    text: &'static str,
    unit: &'static str,
    format: ValueFormat,
) -> ObservationCode {
    ObservationCode {
        identifier,
        text,
        unit,
        format,
    }
}

/// Look up the OBX identification for a parameter.
///
/// Returns `None` for parameters that are decoded but not reported
/// (breath number, plateau pressure, compliance, unknown codes).
pub fn observation_code(parameter: ParameterCode) -> Option<ObservationCode> {
    use ValueFormat::{Fixed, Text};

    let mapped = match parameter {
        ParameterCode::PeakPressure => code("3002-3", "Maximum Positive Airway Pressure", "cmH2O", Fixed(1)),
        ParameterCode::MeanPressure => code("3002-6", "Mean airway pressure", "cmH2O", Fixed(1)),
        ParameterCode::MinPressure => code("3002-2", "Minimum Airway Pressure", "cmH2O", Fixed(1)),
        ParameterCode::Peep => code("3005-4", "PEEP", "cmH2O", Fixed(1)),
        ParameterCode::TidalVolume => code("LP73863-0", "Tidal Volume Expired", "mL", Fixed(0)),
        ParameterCode::MinuteVolume => code("76008-2", "EXP - Minute Volume", "L/min", Fixed(2)),
        ParameterCode::RespRate => code("9279-2", "Respiratory_Rate", "/min", Fixed(0)),
        ParameterCode::IeRatio => code("3008-1", "I:E Ratio", "", Text),
        ParameterCode::FiO2 => code("3008-7", "FIO2", "%", Fixed(0)),
        ParameterCode::SpO2 => code("59408-5", "oxygen_saturation", "%", Fixed(0)),
        ParameterCode::Pulse => code("8867-4", "HR_Pulse", "/min", Fixed(0)),
        ParameterCode::VentilationMode => code("3008-3", "Ventilation Mode", "", Text),
        ParameterCode::BreathNumber
        | ParameterCode::PlateauPressure
        | ParameterCode::Compliance
        | ParameterCode::Unknown { .. } => return None,
    };
    Some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_parameters_mapped() {
        let peep = observation_code(ParameterCode::Peep).unwrap();
        assert_eq!(peep.identifier, "3005-4");
        assert_eq!(peep.unit, "cmH2O");

        let fio2 = observation_code(ParameterCode::FiO2).unwrap();
        assert_eq!(fio2.identifier, "3008-7");
        assert_eq!(fio2.format, ValueFormat::Fixed(0));
    }

    #[test]
    fn test_unreported_parameters() {
        assert!(observation_code(ParameterCode::BreathNumber).is_none());
        assert!(observation_code(ParameterCode::Unknown { group: 0x60, id: 1 }).is_none());
    }
}
