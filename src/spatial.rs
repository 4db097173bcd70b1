//! Per-peer audio parameters derived from the game state.
//!
//! [`calculate`] is evaluated once per tick for every remote player with a
//! live graph. Rules are applied in order and later rules override earlier
//! ones:
//!
//! 1. phase baseline (comms sabotage mutes living crew during tasks)
//! 2. vent muting
//! 3. haunting (reverb for living impostors hearing the dead)
//! 4. living players do not hear the dead during discussion
//! 5. dead-only chat
//! 6. vent muffle
//! 7. distance cutoff, optionally measured from the watched camera
//! 8. spatial audio disabled centers the voice
//!
//! User-side scaling (deafen, per-player volume, ghost volume) happens
//! afterwards in [`scale_gain`].

use crate::audio::MuffleParams;
use crate::config::{HAUNTING_GAIN, MUFFLE_GAIN_CAP, MUFFLE_MAX_DISTANCE, PAN_Z_OFFSET};
use crate::game::{GamePhase, GameState, Player};
use crate::lobby::LobbySettings;

/// Parameters for one peer's audio graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParams {
    pub gain: f32,
    /// Source position relative to the listener; `None` leaves the panner
    /// where it was
    pub pan: Option<[f32; 3]>,
    /// Reverb insert wanted
    pub reverb: bool,
    /// Muffle insert wanted, with its parameters
    pub muffle: Option<MuffleParams>,
}

fn length(v: [f32; 2]) -> f32 {
    (v[0] * v[0] + v[1] * v[1]).sqrt()
}

/// Whether a living impostor should hear this dead player through the
/// haunting rule. Reverb follows this exactly, so it drops as soon as the
/// phase or either player's role or life changes.
fn haunts(phase: GamePhase, lobby: &LobbySettings, me: &Player, other: &Player) -> bool {
    phase == GamePhase::Tasks && lobby.haunting && me.is_alive() && me.is_impostor && other.is_dead
}

/// Compute the audio parameters of `other` as heard by `me`.
pub fn calculate(
    state: &GameState,
    lobby: &LobbySettings,
    spatial_audio: bool,
    me: &Player,
    other: &Player,
) -> AudioParams {
    let mut max_distance = lobby.max_distance;
    let mut pan = [other.x - me.x, other.y - me.y];
    let reverb = haunts(state.phase, lobby, me, other);

    let mut gain = match state.phase {
        GamePhase::Menu | GamePhase::Unknown => 0.0,
        GamePhase::Lobby => 1.0,
        GamePhase::Tasks => {
            let mut gain = 1.0;
            if me.is_alive() && lobby.comms_sabotage && state.coms_sabotaged && !me.is_impostor {
                gain = 0.0;
            }
            let hears_into_vents = lobby.hear_impostors_in_vents
                || (lobby.imposters_hear_imposters_in_vent && me.in_vent);
            if other.in_vent && !hears_into_vents {
                gain = 0.0;
            }
            if reverb {
                gain = HAUNTING_GAIN;
            } else if other.is_dead && me.is_alive() {
                gain = 0.0;
            }
            gain
        }
        GamePhase::Discussion => {
            pan = [0.0, 0.0];
            if me.is_alive() && other.is_dead {
                0.0
            } else {
                1.0
            }
        }
    };

    if lobby.dead_only {
        pan = [0.0, 0.0];
        if me.is_alive() || other.is_alive() {
            gain = 0.0;
        }
    }

    let muffled = state.phase == GamePhase::Tasks
        && ((me.in_vent && me.is_alive()) || (other.in_vent && other.is_alive()));
    let muffle = if muffled {
        max_distance = MUFFLE_MAX_DISTANCE;
        if gain == 1.0 {
            gain = MUFFLE_GAIN_CAP;
        }
        Some(MuffleParams::default())
    } else {
        None
    };

    if length(pan) > max_distance {
        let camera = state
            .current_camera
            .position()
            .filter(|_| lobby.hear_through_cameras);
        let in_range = match camera {
            Some(cam) => {
                pan = [other.x - cam.x, other.y - cam.y];
                length(pan) <= max_distance
            }
            None => false,
        };
        if !in_range {
            return AudioParams {
                gain: 0.0,
                pan: None,
                reverb,
                muffle,
            };
        }
    }

    if !spatial_audio {
        pan = [0.0, 0.0];
    }

    AudioParams {
        gain,
        pan: Some([pan[0], pan[1], PAN_Z_OFFSET]),
        reverb,
        muffle,
    }
}

/// Local-side scaling applied after [`calculate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainScaling {
    pub deafened: bool,
    /// Per-player volume multiplier, if the user set one
    pub player_volume: Option<f32>,
    /// Ghost volume (0-100), applied when the local player is dead and
    /// the remote alive
    pub ghost_volume: Option<f32>,
}

/// Deafen overrides everything; then per-player volume; ghost volume last.
pub fn scale_gain(gain: f32, scaling: &GainScaling) -> f32 {
    if scaling.deafened {
        return 0.0;
    }
    let mut gain = gain;
    if gain > 0.0 {
        if let Some(volume) = scaling.player_volume {
            gain *= volume;
        }
        if let Some(ghost) = scaling.ghost_volume {
            gain *= ghost / 100.0;
        }
    }
    gain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::CameraLocation;

    fn player(client_id: u32, x: f32, y: f32) -> Player {
        Player {
            id: client_id as i32,
            client_id,
            x,
            y,
            ..Default::default()
        }
    }

    fn state(phase: GamePhase) -> GameState {
        GameState {
            phase,
            lobby_code: "ABCDEF".to_string(),
            ..Default::default()
        }
    }

    fn calc(state: &GameState, lobby: &LobbySettings, me: &Player, other: &Player) -> AudioParams {
        calculate(state, lobby, true, me, other)
    }

    #[test]
    fn test_phase_baselines_are_binary() {
        let lobby = LobbySettings::default();
        let me = player(1, 0.0, 0.0);
        let other = player(2, 1.0, 0.0);
        for (phase, expected) in [
            (GamePhase::Menu, 0.0),
            (GamePhase::Lobby, 1.0),
            (GamePhase::Tasks, 1.0),
            (GamePhase::Discussion, 1.0),
            (GamePhase::Unknown, 0.0),
        ] {
            assert_eq!(calc(&state(phase), &lobby, &me, &other).gain, expected, "{:?}", phase);
        }
    }

    #[test]
    fn test_discussion_centers_pan() {
        let lobby = LobbySettings::default();
        let p = calc(&state(GamePhase::Discussion), &lobby, &player(1, 0.0, 0.0), &player(2, 50.0, 3.0));
        assert_eq!(p.gain, 1.0);
        assert_eq!(p.pan, Some([0.0, 0.0, -0.5]));
    }

    #[test]
    fn test_comms_sabotage_mutes_living_crew() {
        let lobby = LobbySettings { comms_sabotage: true, ..Default::default() };
        let mut s = state(GamePhase::Tasks);
        s.coms_sabotaged = true;
        let me = player(1, 0.0, 0.0);
        let other = player(2, 1.0, 0.0);
        assert_eq!(calc(&s, &lobby, &me, &other).gain, 0.0);

        let impostor = Player { is_impostor: true, ..me.clone() };
        assert_eq!(calc(&s, &lobby, &impostor, &other).gain, 1.0);
    }

    #[test]
    fn test_remote_in_vent_is_muted_regardless_of_distance() {
        let lobby = LobbySettings::default();
        let me = player(1, 0.0, 0.0);
        let other = Player { in_vent: true, ..player(2, 0.1, 0.0) };
        let p = calc(&state(GamePhase::Tasks), &lobby, &me, &other);
        assert_eq!(p.gain, 0.0);

        let hearing = LobbySettings { hear_impostors_in_vents: true, ..Default::default() };
        let p = calc(&state(GamePhase::Tasks), &hearing, &me, &other);
        assert_eq!(p.gain, MUFFLE_GAIN_CAP);
    }

    #[test]
    fn test_impostors_in_vents_hear_each_other() {
        let lobby = LobbySettings { imposters_hear_imposters_in_vent: true, ..Default::default() };
        let me = Player { in_vent: true, is_impostor: true, ..player(1, 0.0, 0.0) };
        let other = Player { in_vent: true, is_impostor: true, ..player(2, 0.3, 0.0) };
        let p = calc(&state(GamePhase::Tasks), &lobby, &me, &other);
        assert_eq!(p.gain, MUFFLE_GAIN_CAP);
        assert!(p.muffle.is_some());
    }

    #[test]
    fn test_haunting_is_independent_of_distance() {
        let lobby = LobbySettings { haunting: true, ..Default::default() };
        let me = Player { is_impostor: true, ..player(1, 0.0, 0.0) };
        let ghost = Player { is_dead: true, ..player(2, 3.0, 0.0) };
        let p = calc(&state(GamePhase::Tasks), &lobby, &me, &ghost);
        assert!(p.reverb);
        assert_eq!(p.gain, HAUNTING_GAIN);

        // Haunting is decided before the distance cutoff
        let far = Player { is_dead: true, ..player(2, 100.0, 0.0) };
        let p = calc(&state(GamePhase::Tasks), &lobby, &me, &far);
        assert!(p.reverb);
        assert_eq!(p.pan, None);
    }

    #[test]
    fn test_reverb_drops_on_phase_or_role_change() {
        let lobby = LobbySettings { haunting: true, ..Default::default() };
        let me = Player { is_impostor: true, ..player(1, 0.0, 0.0) };
        let ghost = Player { is_dead: true, ..player(2, 1.0, 0.0) };
        assert!(!calc(&state(GamePhase::Discussion), &lobby, &me, &ghost).reverb);
        assert!(!calc(&state(GamePhase::Lobby), &lobby, &me, &ghost).reverb);

        let dead_me = Player { is_dead: true, ..me.clone() };
        assert!(!calc(&state(GamePhase::Tasks), &lobby, &dead_me, &ghost).reverb);

        let crew = Player { is_impostor: false, ..me };
        let p = calc(&state(GamePhase::Tasks), &lobby, &crew, &ghost);
        assert!(!p.reverb);
        assert_eq!(p.gain, 0.0);
    }

    #[test]
    fn test_discussion_mutes_dead_for_living() {
        let lobby = LobbySettings::default();
        let ghost = Player { is_dead: true, ..player(2, 1.0, 0.0) };
        assert_eq!(calc(&state(GamePhase::Discussion), &lobby, &player(1, 0.0, 0.0), &ghost).gain, 0.0);

        let dead_me = Player { is_dead: true, ..player(1, 0.0, 0.0) };
        assert_eq!(calc(&state(GamePhase::Discussion), &lobby, &dead_me, &ghost).gain, 1.0);
    }

    #[test]
    fn test_dead_only_chat() {
        let lobby = LobbySettings { dead_only: true, ..Default::default() };
        let dead_me = Player { is_dead: true, ..player(1, 0.0, 0.0) };
        let ghost = Player { is_dead: true, ..player(2, 40.0, 0.0) };
        let p = calc(&state(GamePhase::Lobby), &lobby, &dead_me, &ghost);
        assert_eq!(p.gain, 1.0);
        assert_eq!(p.pan, Some([0.0, 0.0, -0.5]));

        let p = calc(&state(GamePhase::Lobby), &lobby, &player(1, 0.0, 0.0), &ghost);
        assert_eq!(p.gain, 0.0);
    }

    #[test]
    fn test_muffle_shrinks_range_and_caps_gain() {
        let lobby = LobbySettings::default();
        let me = Player { in_vent: true, is_impostor: true, ..player(1, 0.0, 0.0) };

        let near = player(2, 0.5, 0.0);
        let p = calc(&state(GamePhase::Tasks), &lobby, &me, &near);
        assert_eq!(p.muffle, Some(MuffleParams::default()));
        assert_eq!(p.gain, MUFFLE_GAIN_CAP);

        // In range normally, out of range while muffled
        let mid = player(2, 2.0, 0.0);
        let p = calc(&state(GamePhase::Tasks), &lobby, &me, &mid);
        assert!(p.muffle.is_some());
        assert_eq!(p.gain, 0.0);
        assert_eq!(p.pan, None);
    }

    #[test]
    fn test_dead_player_in_vent_does_not_muffle() {
        let lobby = LobbySettings { hear_impostors_in_vents: true, ..Default::default() };
        let dead_me = Player { in_vent: true, is_dead: true, ..player(1, 0.0, 0.0) };
        let p = calc(&state(GamePhase::Tasks), &lobby, &dead_me, &player(2, 1.0, 0.0));
        assert!(p.muffle.is_none());
        assert_eq!(p.gain, 1.0);
    }

    #[test]
    fn test_distance_cutoff_skips_pan() {
        let lobby = LobbySettings::default();
        let me = player(1, 0.0, 0.0);
        let p = calc(&state(GamePhase::Lobby), &lobby, &me, &player(2, 5.0, 0.0));
        assert_eq!(p.gain, 1.0);
        assert_eq!(p.pan, Some([5.0, 0.0, -0.5]));

        let p = calc(&state(GamePhase::Lobby), &lobby, &me, &player(2, 5.33, 0.0));
        assert_eq!(p.gain, 0.0);
        assert_eq!(p.pan, None);
    }

    #[test]
    fn test_camera_override() {
        let lobby = LobbySettings { hear_through_cameras: true, ..Default::default() };
        let mut s = state(GamePhase::Tasks);
        s.current_camera = CameraLocation::Central;
        let me = player(1, 0.0, 0.0);
        let near_camera = player(2, 16.4, -15.4);
        let p = calc(&s, &lobby, &me, &near_camera);
        assert_eq!(p.gain, 1.0);
        let pan = p.pan.unwrap();
        assert!((pan[0] - 1.0).abs() < 1e-4 && pan[1].abs() < 1e-4);

        let far_from_both = player(2, 60.0, 60.0);
        assert_eq!(calc(&s, &lobby, &me, &far_from_both).pan, None);

        s.current_camera = CameraLocation::Skeld;
        assert_eq!(calc(&s, &lobby, &me, &near_camera).gain, 0.0);

        let no_rule = LobbySettings::default();
        s.current_camera = CameraLocation::Central;
        assert_eq!(calc(&s, &no_rule, &me, &near_camera).gain, 0.0);
    }

    #[test]
    fn test_spatial_audio_disabled_centers_pan_only() {
        let lobby = LobbySettings::default();
        let p = calculate(&state(GamePhase::Lobby), &lobby, false, &player(1, 0.0, 0.0), &player(2, 2.0, 1.0));
        assert_eq!(p.gain, 1.0);
        assert_eq!(p.pan, Some([0.0, 0.0, -0.5]));
    }

    #[test]
    fn test_scale_gain_order() {
        let base = GainScaling { deafened: false, player_volume: None, ghost_volume: None };
        assert_eq!(scale_gain(1.0, &base), 1.0);
        assert_eq!(scale_gain(1.0, &GainScaling { deafened: true, ..base }), 0.0);
        assert_eq!(scale_gain(1.0, &GainScaling { player_volume: Some(0.5), ..base }), 0.5);
        assert_eq!(
            scale_gain(1.0, &GainScaling { player_volume: Some(0.5), ghost_volume: Some(50.0), ..base }),
            0.25
        );
        assert_eq!(scale_gain(0.0, &GainScaling { player_volume: Some(2.0), ..base }), 0.0);
    }
}
