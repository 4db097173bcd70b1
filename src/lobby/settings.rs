//! Lobby rule set and its default table.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SettingsError;

/// Host-owned lobby rules replicated to every peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LobbySettings {
    /// Hearing range in world units
    pub max_distance: f32,
    /// Living impostors hear dead players faintly, with reverb
    pub haunting: bool,
    /// Everyone hears players inside vents
    pub hear_impostors_in_vents: bool,
    /// Players inside vents hear other players inside vents
    #[serde(
        rename = "impostersHearImpostersInvent",
        alias = "impostersHearImpostersInVent"
    )]
    pub imposters_hear_imposters_in_vent: bool,
    /// Living crew go deaf while comms are sabotaged
    pub comms_sabotage: bool,
    /// Only dead players can talk to each other
    pub dead_only: bool,
    /// Distance is measured from the camera being watched
    pub hear_through_cameras: bool,
}

impl Default for LobbySettings {
    fn default() -> Self {
        Self {
            max_distance: 5.32,
            haunting: false,
            hear_impostors_in_vents: false,
            imposters_hear_imposters_in_vent: false,
            comms_sabotage: false,
            dead_only: false,
            hear_through_cameras: false,
        }
    }
}

/// Every field the engine recognizes in a settings payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LobbySettingsField {
    MaxDistance,
    Haunting,
    HearImpostorsInVents,
    ImpostersHearImpostersInVent,
    CommsSabotage,
    DeadOnly,
    HearThroughCameras,
}

/// Fields that hosts running older clients reliably transmit.
/// Everything else is reset to default when joining as a guest.
pub const LEGACY_COMPATIBLE_FIELDS: [LobbySettingsField; 4] = [
    LobbySettingsField::MaxDistance,
    LobbySettingsField::Haunting,
    LobbySettingsField::HearImpostorsInVents,
    LobbySettingsField::CommsSabotage,
];

impl LobbySettingsField {
    pub const ALL: [LobbySettingsField; 7] = [
        LobbySettingsField::MaxDistance,
        LobbySettingsField::Haunting,
        LobbySettingsField::HearImpostorsInVents,
        LobbySettingsField::ImpostersHearImpostersInVent,
        LobbySettingsField::CommsSabotage,
        LobbySettingsField::DeadOnly,
        LobbySettingsField::HearThroughCameras,
    ];

    /// JSON key as sent on the wire
    pub fn key(self) -> &'static str {
        match self {
            LobbySettingsField::MaxDistance => "maxDistance",
            LobbySettingsField::Haunting => "haunting",
            LobbySettingsField::HearImpostorsInVents => "hearImpostorsInVents",
            LobbySettingsField::ImpostersHearImpostersInVent => "impostersHearImpostersInvent",
            LobbySettingsField::CommsSabotage => "commsSabotage",
            LobbySettingsField::DeadOnly => "deadOnly",
            LobbySettingsField::HearThroughCameras => "hearThroughCameras",
        }
    }

    /// Alternate spellings accepted on input
    fn aliases(self) -> &'static [&'static str] {
        match self {
            LobbySettingsField::ImpostersHearImpostersInVent => &["impostersHearImpostersInVent"],
            _ => &[],
        }
    }

    pub fn is_legacy_compatible(self) -> bool {
        LEGACY_COMPATIBLE_FIELDS.contains(&self)
    }
}

impl LobbySettings {
    /// Reset one field to the default table value
    pub fn reset_field(&mut self, field: LobbySettingsField) {
        let defaults = LobbySettings::default();
        match field {
            LobbySettingsField::MaxDistance => self.max_distance = defaults.max_distance,
            LobbySettingsField::Haunting => self.haunting = defaults.haunting,
            LobbySettingsField::HearImpostorsInVents => {
                self.hear_impostors_in_vents = defaults.hear_impostors_in_vents
            }
            LobbySettingsField::ImpostersHearImpostersInVent => {
                self.imposters_hear_imposters_in_vent = defaults.imposters_hear_imposters_in_vent
            }
            LobbySettingsField::CommsSabotage => self.comms_sabotage = defaults.comms_sabotage,
            LobbySettingsField::DeadOnly => self.dead_only = defaults.dead_only,
            LobbySettingsField::HearThroughCameras => {
                self.hear_through_cameras = defaults.hear_through_cameras
            }
        }
    }

    /// Reset every field outside [`LEGACY_COMPATIBLE_FIELDS`]
    pub fn reset_non_legacy_fields(&mut self) {
        for field in LobbySettingsField::ALL {
            if !field.is_legacy_compatible() {
                self.reset_field(field);
            }
        }
    }

    /// Set a field from a JSON value. Returns false if the value has the wrong type.
    fn set_from_value(&mut self, field: LobbySettingsField, value: &Value) -> bool {
        if field == LobbySettingsField::MaxDistance {
            return match value.as_f64() {
                Some(v) if v.is_finite() && v >= 0.0 => {
                    self.max_distance = v as f32;
                    true
                }
                _ => false,
            };
        }

        let Some(flag) = value.as_bool() else {
            return false;
        };
        match field {
            LobbySettingsField::Haunting => self.haunting = flag,
            LobbySettingsField::HearImpostorsInVents => self.hear_impostors_in_vents = flag,
            LobbySettingsField::ImpostersHearImpostersInVent => {
                self.imposters_hear_imposters_in_vent = flag
            }
            LobbySettingsField::CommsSabotage => self.comms_sabotage = flag,
            LobbySettingsField::DeadOnly => self.dead_only = flag,
            LobbySettingsField::HearThroughCameras => self.hear_through_cameras = flag,
            LobbySettingsField::MaxDistance => unreachable!(),
        }
        true
    }

    /// Apply a settings object received from the host.
    ///
    /// Recognized fields present in the payload are copied; recognized fields
    /// that are missing or carry the wrong type fall back to the default
    /// table. Unknown keys are ignored.
    pub fn apply_payload(&mut self, payload: &Value) -> Result<(), SettingsError> {
        let object = payload.as_object().ok_or(SettingsError::NotAnObject)?;

        for field in LobbySettingsField::ALL {
            let value = std::iter::once(field.key())
                .chain(field.aliases().iter().copied())
                .find_map(|key| object.get(key));

            match value {
                Some(v) if self.set_from_value(field, v) => {}
                Some(v) => {
                    debug!("[LobbySettings] Ignoring {} with unexpected value {}", field.key(), v);
                    self.reset_field(field);
                }
                None => self.reset_field(field),
            }
        }
        Ok(())
    }

    /// Parse and apply a raw data-channel payload
    pub fn apply_json(&mut self, data: &[u8]) -> Result<(), SettingsError> {
        let payload: Value = serde_json::from_slice(data)?;
        self.apply_payload(&payload)
    }

    /// Encode the full settings object for the data channel
    pub fn to_payload(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_table() {
        let s = LobbySettings::default();
        assert_eq!(s.max_distance, 5.32);
        assert!(!s.haunting);
        assert!(!s.dead_only);
        assert!(!s.hear_through_cameras);
    }

    #[test]
    fn test_payload_uses_wire_names() {
        let payload = LobbySettings::default().to_payload().unwrap();
        assert!(payload.contains("\"maxDistance\":5.32"));
        assert!(payload.contains("\"impostersHearImpostersInvent\":false"));
        assert!(payload.contains("\"hearThroughCameras\":false"));
    }

    #[test]
    fn test_apply_full_payload() {
        let mut s = LobbySettings::default();
        s.apply_payload(&json!({
            "maxDistance": 8.0,
            "haunting": true,
            "hearImpostorsInVents": true,
            "impostersHearImpostersInvent": true,
            "commsSabotage": true,
            "deadOnly": true,
            "hearThroughCameras": true
        }))
        .unwrap();
        assert_eq!(s.max_distance, 8.0);
        assert!(s.haunting && s.hear_impostors_in_vents && s.imposters_hear_imposters_in_vent);
        assert!(s.comms_sabotage && s.dead_only && s.hear_through_cameras);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let mut s = LobbySettings {
            max_distance: 2.0,
            dead_only: true,
            hear_through_cameras: true,
            ..Default::default()
        };
        s.apply_payload(&json!({ "maxDistance": 3.0, "haunting": true, "extra": 42 }))
            .unwrap();
        assert_eq!(s.max_distance, 3.0);
        assert!(s.haunting);
        assert!(!s.dead_only);
        assert!(!s.hear_through_cameras);
    }

    #[test]
    fn test_wrong_types_are_defaulted_not_raised() {
        let mut s = LobbySettings { haunting: true, ..Default::default() };
        s.apply_payload(&json!({ "maxDistance": "far", "haunting": "yes" })).unwrap();
        assert_eq!(s.max_distance, LobbySettings::default().max_distance);
        assert!(!s.haunting);
    }

    #[test]
    fn test_alias_spelling_accepted() {
        let mut s = LobbySettings::default();
        s.apply_payload(&json!({ "impostersHearImpostersInVent": true })).unwrap();
        assert!(s.imposters_hear_imposters_in_vent);
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let mut s = LobbySettings { max_distance: 9.0, ..Default::default() };
        assert!(s.apply_json(b"[1,2,3]").is_err());
        assert!(s.apply_json(b"not json").is_err());
        assert_eq!(s.max_distance, 9.0);
    }

    #[test]
    fn test_reset_non_legacy_fields() {
        let mut s = LobbySettings {
            max_distance: 7.5,
            haunting: true,
            hear_impostors_in_vents: true,
            imposters_hear_imposters_in_vent: true,
            comms_sabotage: true,
            dead_only: true,
            hear_through_cameras: true,
        };
        s.reset_non_legacy_fields();
        assert_eq!(s.max_distance, 7.5);
        assert!(s.haunting && s.hear_impostors_in_vents && s.comms_sabotage);
        assert!(!s.imposters_hear_imposters_in_vent);
        assert!(!s.dead_only);
        assert!(!s.hear_through_cameras);
    }
}
