//! Voice-state snapshot published to the overlay.

use std::collections::HashMap;

use serde::Serialize;

use crate::peer::PeerId;
use crate::signaling::Client;

/// Everything the overlay shows about voice
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    /// Client id to talking flag
    pub other_talking: HashMap<u32, bool>,
    /// Client id to relay peer id
    pub player_socket_ids: HashMap<u32, PeerId>,
    /// Client id to dead-or-disconnected flag
    pub other_dead: HashMap<u32, bool>,
    pub socket_clients: HashMap<PeerId, Client>,
    pub audio_connected: HashMap<PeerId, bool>,
    pub local_talking: bool,
    pub local_is_alive: bool,
}

/// Remembers the last published snapshot
#[derive(Debug, Default)]
pub struct VoiceStateTracker {
    last: Option<VoiceState>,
}

impl VoiceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot if it differs from the last one published
    pub fn update(&mut self, state: VoiceState) -> Option<VoiceState> {
        if self.last.as_ref() == Some(&state) {
            return None;
        }
        self.last = Some(state.clone());
        Some(state)
    }

    pub fn last(&self) -> Option<&VoiceState> {
        self.last.as_ref()
    }
}
