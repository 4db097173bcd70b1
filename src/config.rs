//! User configuration and engine constants.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::lobby::LobbySettings;

/// Sample rate of every audio graph (Hz)
pub const SAMPLE_RATE: u32 = 48000;

/// Decode frame length (ms)
pub const FRAME_MS: usize = 20;

/// Delay before the host pushes settings to a freshly connected peer,
/// leaving the remote side time to finish building its graph
pub const SETTINGS_PUSH_DELAY: Duration = Duration::from_millis(1000);

/// Gain changes are ramped over this many milliseconds
pub const GAIN_RAMP_MS: f32 = 10.0;

/// Panner reference distance (world units)
pub const PANNER_REF_DISTANCE: f32 = 0.1;

/// Panner rolloff factor for the linear distance model
pub const PANNER_ROLLOFF: f32 = 1.0;

/// Forward offset of every source so centered voices are not inside the listener
pub const PAN_Z_OFFSET: f32 = -0.5;

/// Gain of a dead player heard through the haunting rule
pub const HAUNTING_GAIN: f32 = 0.2;

/// Hearing range while either party is in a vent
pub const MUFFLE_MAX_DISTANCE: f32 = 0.8;

/// Gain ceiling while muffled
pub const MUFFLE_GAIN_CAP: f32 = 0.5;

/// Muffle low-pass cutoff (Hz)
pub const MUFFLE_FREQUENCY: f32 = 2000.0;

/// Muffle low-pass resonance
pub const MUFFLE_Q: f32 = 20.0;

/// Per-player preferences keyed by client id
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Volume multiplier (1.0 = unchanged)
    pub volume: f32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self { volume: 1.0 }
    }
}

/// User settings consumed by the engine.
///
/// Persistence belongs to the host application; this is the typed view it
/// hands over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSettings {
    /// Relay/signaling server URL
    #[serde(rename = "serverURL", alias = "serverUrl")]
    pub server_url: String,
    /// Microphone device id, "default" for the system default
    pub microphone: String,
    /// Speaker device id, "default" for the system default
    pub speaker: String,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub enable_spatial_audio: bool,
    /// Volume of living players heard by a dead local player (0-100)
    pub ghost_volume: f32,
    pub push_to_talk: bool,
    pub player_config_map: HashMap<u32, PlayerConfig>,
    /// Force relayed (TURN) connections with the built-in relay
    pub nat_fix: bool,
    pub vad_enabled: bool,
    pub enable_overlay: bool,
    /// Mirror game state to a companion mobile client
    pub mobile_host: bool,
    /// Settings this client enforces when it hosts
    pub local_lobby_settings: LobbySettings,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            server_url: "https://bettercrewl.ink".to_string(),
            microphone: "Default".to_string(),
            speaker: "Default".to_string(),
            echo_cancellation: true,
            noise_suppression: true,
            enable_spatial_audio: true,
            ghost_volume: 100.0,
            push_to_talk: false,
            player_config_map: HashMap::new(),
            nat_fix: false,
            vad_enabled: true,
            enable_overlay: true,
            mobile_host: false,
            local_lobby_settings: LobbySettings::default(),
        }
    }
}

impl UserSettings {
    /// Parse settings from JSON; missing keys take their defaults
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Per-player volume multiplier, if the user set one
    pub fn player_volume(&self, client_id: u32) -> Option<f32> {
        self.player_config_map.get(&client_id).map(|c| c.volume)
    }

    /// Make sure every listed client has a volume entry.
    /// Returns true if any entry was added.
    pub fn ensure_player_configs<I: IntoIterator<Item = u32>>(&mut self, client_ids: I) -> bool {
        let mut added = false;
        for id in client_ids {
            if let std::collections::hash_map::Entry::Vacant(e) = self.player_config_map.entry(id) {
                e.insert(PlayerConfig::default());
                added = true;
            }
        }
        added
    }

    /// Capture constraints for the external microphone collaborator
    pub fn microphone_constraints(&self) -> MicrophoneConstraints {
        let device_id = if self.microphone.eq_ignore_ascii_case("default") {
            None
        } else {
            Some(self.microphone.clone())
        };
        MicrophoneConstraints {
            device_id,
            auto_gain_control: false,
            channel_count: 2,
            echo_cancellation: self.echo_cancellation,
            latency: 0.0,
            noise_suppression: self.noise_suppression,
        }
    }

    /// Speaker device id, `None` for the system default
    pub fn speaker_device(&self) -> Option<&str> {
        if self.speaker.eq_ignore_ascii_case("default") {
            None
        } else {
            Some(&self.speaker)
        }
    }
}

/// Microphone acquisition request
#[derive(Debug, Clone, PartialEq)]
pub struct MicrophoneConstraints {
    pub device_id: Option<String>,
    pub auto_gain_control: bool,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub latency: f32,
    pub noise_suppression: bool,
}
