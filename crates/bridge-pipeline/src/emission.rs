//! Emission Policy
//!
//! Decides which decoded snapshots become outgoing messages.

use serde::{Deserialize, Serialize};
use vent_protocol::{ParameterCode, ParameterSnapshot};

/// When a decoded snapshot turns into a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitPolicy {
    /// One message per decoded frame
    #[default]
    EveryFrame,
    /// Accumulate frames and emit the merged view once per breath
    OnNewBreath,
}

/// Applies an [`EmitPolicy`] to the stream of snapshots
#[derive(Debug)]
pub struct EmissionGate {
    policy: EmitPolicy,
    /// Running merged view under `OnNewBreath`
    view: Option<ParameterSnapshot>,
}

impl EmissionGate {
    pub fn new(policy: EmitPolicy) -> Self {
        Self { policy, view: None }
    }

    /// Feed one snapshot; returns the snapshot to emit, if any
    pub fn offer(&mut self, snapshot: ParameterSnapshot) -> Option<ParameterSnapshot> {
        match self.policy {
            EmitPolicy::EveryFrame => Some(snapshot),
            EmitPolicy::OnNewBreath => {
                let previous = self
                    .view
                    .as_ref()
                    .and_then(|view| view.get(ParameterCode::BreathNumber).cloned());

                if let Some(view) = self.view.as_mut() {
                    view.merge(&snapshot);
                } else {
                    self.view = Some(snapshot);
                }

                let view = self.view.as_ref()?;
                let current = view.get(ParameterCode::BreathNumber)?;
                if previous.as_ref() == Some(current) {
                    return None;
                }
                Some(view.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vent_protocol::{ParameterValue, RecordType};

    fn snapshot(offset_ms: i64, values: &[(ParameterCode, f64)]) -> ParameterSnapshot {
        let at = Utc::now() + Duration::milliseconds(offset_ms);
        let mut snapshot = ParameterSnapshot::new(at, RecordType::MixedMode);
        for (code, value) in values {
            snapshot.insert(*code, ParameterValue::Numeric(*value));
        }
        snapshot
    }

    #[test]
    fn test_every_frame_passes_through() {
        let mut gate = EmissionGate::new(EmitPolicy::EveryFrame);
        let snap = snapshot(0, &[(ParameterCode::Peep, 5.0)]);
        assert_eq!(gate.offer(snap.clone()), Some(snap));
    }

    #[test]
    fn test_on_new_breath_emits_on_change_only() {
        let mut gate = EmissionGate::new(EmitPolicy::OnNewBreath);

        // No breath number yet
        assert!(gate.offer(snapshot(0, &[(ParameterCode::Peep, 5.0)])).is_none());

        let first = gate
            .offer(snapshot(10, &[(ParameterCode::BreathNumber, 1.0)]))
            .unwrap();
        assert_eq!(first.get(ParameterCode::Peep), Some(&ParameterValue::Numeric(5.0)));

        // Same breath, new values accumulate silently
        assert!(gate
            .offer(snapshot(20, &[(ParameterCode::BreathNumber, 1.0), (ParameterCode::FiO2, 40.0)]))
            .is_none());

        let second = gate
            .offer(snapshot(30, &[(ParameterCode::BreathNumber, 2.0), (ParameterCode::Peep, 6.0)]))
            .unwrap();
        assert_eq!(second.get(ParameterCode::Peep), Some(&ParameterValue::Numeric(6.0)));
        assert_eq!(second.get(ParameterCode::FiO2), Some(&ParameterValue::Numeric(40.0)));
    }

    #[test]
    fn test_first_snapshot_with_breath_number_emits() {
        let mut gate = EmissionGate::new(EmitPolicy::OnNewBreath);
        assert!(gate
            .offer(snapshot(0, &[(ParameterCode::BreathNumber, 7.0)]))
            .is_some());
    }
}
