//! Mute, deafen and push-to-talk gating of the outgoing microphone track.

use std::sync::Arc;

use log::debug;

use crate::audio::MediaTrack;

/// Snapshot of the local input state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputState {
    pub muted: bool,
    pub deafened: bool,
    pub push_to_talk: bool,
    /// Talk key currently held
    pub pressing: bool,
    /// Whether the outgoing track is enabled
    pub transmitting: bool,
}

/// State machine driving the microphone track's enabled flag.
///
/// Deafening implies muting: toggling deafen on clears an explicit mute,
/// and toggling mute while deafened clears both.
#[derive(Debug, Default)]
pub struct LocalInputController {
    muted: bool,
    deafened: bool,
    push_to_talk: bool,
    pressing: bool,
    track: Option<Arc<MediaTrack>>,
}

impl LocalInputController {
    pub fn new(push_to_talk: bool) -> Self {
        Self {
            push_to_talk,
            ..Default::default()
        }
    }

    /// Start gating a freshly acquired microphone track
    pub fn attach(&mut self, track: Arc<MediaTrack>) {
        self.track = Some(track);
        self.apply();
    }

    /// Forget the track at the end of a voice session
    pub fn detach(&mut self) -> Option<Arc<MediaTrack>> {
        self.track.take()
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn transmitting(&self) -> bool {
        !self.muted && !self.deafened && (!self.push_to_talk || self.pressing)
    }

    pub fn state(&self) -> InputState {
        InputState {
            muted: self.muted,
            deafened: self.deafened,
            push_to_talk: self.push_to_talk,
            pressing: self.pressing,
            transmitting: self.transmitting(),
        }
    }

    fn apply(&self) -> InputState {
        let state = self.state();
        if let Some(track) = &self.track {
            track.set_enabled(state.transmitting);
        }
        debug!("[Input] {:?}", state);
        state
    }

    pub fn toggle_deafen(&mut self) -> InputState {
        self.deafened = !self.deafened;
        if self.deafened {
            self.muted = false;
        }
        self.apply()
    }

    pub fn toggle_mute(&mut self) -> InputState {
        self.muted = !self.muted;
        if self.deafened {
            self.deafened = false;
            self.muted = false;
        }
        self.apply()
    }

    /// Switch push-to-talk mode on or off
    pub fn set_push_to_talk(&mut self, enabled: bool) -> InputState {
        self.push_to_talk = enabled;
        self.apply()
    }

    /// Talk key pressed or released. Ignored outside push-to-talk mode.
    pub fn push_to_talk(&mut self, pressing: bool) -> InputState {
        if !self.push_to_talk {
            return self.state();
        }
        self.pressing = pressing;
        self.apply()
    }
}
