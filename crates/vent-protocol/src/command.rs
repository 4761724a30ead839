//! Device Commands

use crate::frame::seal;
use serde::{Deserialize, Serialize};

/// Command byte for "Activate Mixed Mode"; data frames echo it as record type
pub const CMD_ACTIVATE_MIXED_MODE: u8 = 0x31;

/// Waveform streaming off
const WAVEFORMS_OFF: u8 = 0x30;

/// Data groups the ventilator can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataGroup {
    /// Device identification strings
    Identifications = 0x40,
    /// Software versions
    SoftwareVersions = 0x41,
    /// Breath-by-breath monitored parameters
    MonitoredParameters = 0x50,
    /// Currently active alarms
    ActiveAlarms = 0x60,
    /// Operator control settings
    ControlSettings = 0x70,
}

impl DataGroup {
    /// Look up a group by its wire ID
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x40 => Some(DataGroup::Identifications),
            0x41 => Some(DataGroup::SoftwareVersions),
            0x50 => Some(DataGroup::MonitoredParameters),
            0x60 => Some(DataGroup::ActiveAlarms),
            0x70 => Some(DataGroup::ControlSettings),
            _ => None,
        }
    }

    /// Wire ID of this group
    pub fn id(&self) -> u8 {
        *self as u8
    }
}

/// How often the device should send a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SendMode {
    /// Only on the repeat timer
    TimedOnly = 0x30,
    /// A single time
    Once = 0x31,
    /// After every breath
    BreathByBreath = 0x32,
    /// Whenever a value changes
    OnChange = 0x33,
}

/// Build the "Activate Mixed Mode" request the bridge sends on connect.
///
/// Waveforms off, monitored parameters breath-by-breath, control settings
/// on change, repeat timers zero.
pub fn activate_mixed_mode() -> Vec<u8> {
    build_activation(&[
        (DataGroup::MonitoredParameters, SendMode::BreathByBreath, 0),
        (DataGroup::ControlSettings, SendMode::OnChange, 0),
    ])
}

fn build_activation(groups: &[(DataGroup, SendMode, u16)]) -> Vec<u8> {
    let mut body = vec![CMD_ACTIVATE_MIXED_MODE, WAVEFORMS_OFF];
    for (group, mode, repeat_timer) in groups {
        body.push(group.id());
        body.push(*mode as u8);
        // Three ASCII digits; the device caps the timer at 999
        body.extend_from_slice(format!("{:03}", (*repeat_timer).min(999)).as_bytes());
    }
    seal(&body)
}
