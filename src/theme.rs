//! Coarse alarm classification of the current detections.

use serde::{Deserialize, Serialize};

use crate::detect::ThreatDetection;
use crate::profiles::{AccessLevel, DetectionResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Theme {
    #[serde(rename = "theme-red")]
    Alarm,
    #[serde(rename = "theme-yellow")]
    Caution,
    #[default]
    #[serde(rename = "theme-neutral")]
    Neutral,
}

/// Derive the theme with fixed precedence: threat, unknown person, denied
/// profile, partial access, neutral.
pub fn derive_theme(faces: &[DetectionResult], threats: &[ThreatDetection]) -> Theme {
    if !threats.is_empty() {
        return Theme::Alarm;
    }
    if faces.iter().any(|result| result.profile().is_unknown()) {
        return Theme::Alarm;
    }
    let levels: Vec<AccessLevel> = faces.iter().map(|r| r.profile().access_level()).collect();
    if levels.contains(&AccessLevel::Denied) {
        Theme::Alarm
    } else if levels.contains(&AccessLevel::Partial) {
        Theme::Caution
    } else {
        Theme::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FaceRect;
    use crate::profiles::ProfileRecord;

    fn face(status: &str) -> DetectionResult {
        DetectionResult(
            FaceRect::new(0, 0, 10, 10),
            ProfileRecord {
                name: "Ada".into(),
                surname: "Lovelace".into(),
                status: status.into(),
                dynamic_field: "12".into(),
            },
        )
    }

    fn threat() -> ThreatDetection {
        ThreatDetection {
            label: "KNIFE 0.91".into(),
            confidence: 0.91,
            bbox: [0, 0, 5, 5],
        }
    }

    #[test]
    fn threat_and_denied_profile_is_alarm() {
        assert_eq!(derive_theme(&[face("Access Denied")], &[threat()]), Theme::Alarm);
    }

    #[test]
    fn denied_profile_alone_is_alarm() {
        assert_eq!(derive_theme(&[face("Access Denied")], &[]), Theme::Alarm);
        assert_eq!(derive_theme(&[face("No profile for Bob")], &[]), Theme::Alarm);
    }

    #[test]
    fn unknown_person_is_alarm() {
        let unknown = DetectionResult(FaceRect::default(), ProfileRecord::unknown_person());
        assert_eq!(derive_theme(&[face("Full Access"), unknown], &[]), Theme::Alarm);
    }

    #[test]
    fn denied_outranks_partial() {
        let faces = [face("Only first floor"), face("Access Denied")];
        assert_eq!(derive_theme(&faces, &[]), Theme::Alarm);
    }

    #[test]
    fn partial_access_is_caution_and_full_is_neutral() {
        assert_eq!(derive_theme(&[face("Only first floor")], &[]), Theme::Caution);
        assert_eq!(derive_theme(&[face("Full Access")], &[]), Theme::Neutral);
        assert_eq!(derive_theme(&[], &[]), Theme::Neutral);
    }

    #[test]
    fn serializes_to_theme_identifiers() {
        assert_eq!(serde_json::to_string(&Theme::Alarm).unwrap(), "\"theme-red\"");
        assert_eq!(serde_json::to_string(&Theme::Caution).unwrap(), "\"theme-yellow\"");
        assert_eq!(serde_json::to_string(&Theme::Neutral).unwrap(), "\"theme-neutral\"");
    }
}
