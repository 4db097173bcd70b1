//! Host-authoritative replication of the lobby settings.
//!
//! The host pushes the full settings object over each peer's data channel.
//! Guests accept payloads only from the connection whose client id matches
//! the host id of the current game state.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use super::settings::LobbySettings;
use crate::error::SettingsError;

#[derive(Debug)]
struct Versioned {
    settings: LobbySettings,
    version: u64,
}

/// Shared, versioned handle to the settings currently in force.
///
/// Long-lived callbacks hold a clone of this handle and read it when they
/// run, never a copy taken when they were created.
#[derive(Debug, Clone)]
pub struct SharedLobbySettings {
    inner: Arc<RwLock<Versioned>>,
}

impl SharedLobbySettings {
    pub fn new(settings: LobbySettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned { settings, version: 0 })),
        }
    }

    /// Current settings
    pub fn get(&self) -> LobbySettings {
        self.inner.read().settings
    }

    /// Monotonic counter bumped on every effective change
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Mutate the settings; the version only moves if something changed.
    /// Returns the settings before the update when they changed.
    pub fn update<F: FnOnce(&mut LobbySettings)>(&self, f: F) -> Option<LobbySettings> {
        let mut guard = self.inner.write();
        let before = guard.settings;
        f(&mut guard.settings);
        if guard.settings != before {
            guard.version += 1;
            Some(before)
        } else {
            None
        }
    }

    /// Replace the settings wholesale
    pub fn replace(&self, settings: LobbySettings) -> Option<LobbySettings> {
        self.update(|s| *s = settings)
    }
}

impl Default for SharedLobbySettings {
    fn default() -> Self {
        Self::new(LobbySettings::default())
    }
}

/// Who owns the canonical settings in the current lobby
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostAuthority {
    /// Client id of the host
    pub host_id: u32,
    /// Whether the local client is the host
    pub is_host: bool,
}

/// Result of handling a settings payload from a peer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReceiveOutcome {
    /// Payload came from the host and was applied
    Applied {
        /// Settings before the payload, if anything changed
        previous: Option<LobbySettings>,
    },
    /// Sender is not the authoritative host
    Untrusted,
    /// Sender is the host but the payload could not be read
    Malformed,
}

/// Replicates lobby settings between the host and its guests
#[derive(Debug)]
pub struct LobbySettingsSync {
    lobby: SharedLobbySettings,
    authority: HostAuthority,
}

impl LobbySettingsSync {
    pub fn new(lobby: SharedLobbySettings) -> Self {
        Self {
            lobby,
            authority: HostAuthority::default(),
        }
    }

    /// Handle to the settings in force
    pub fn settings(&self) -> &SharedLobbySettings {
        &self.lobby
    }

    pub fn authority(&self) -> HostAuthority {
        self.authority
    }

    pub fn is_host(&self) -> bool {
        self.authority.is_host
    }

    /// Record the host reported by the latest tick.
    /// Returns true if the local client just became host.
    pub fn set_authority(&mut self, authority: HostAuthority) -> bool {
        let became_host = authority.is_host && !self.authority.is_host;
        self.authority = authority;
        became_host
    }

    /// A local edit of the canonical settings.
    ///
    /// Only the host applies the edit; the returned payload is what must be
    /// pushed to every connected peer.
    pub fn local_change(&mut self, settings: LobbySettings) -> Result<Option<String>, SettingsError> {
        if !self.authority.is_host {
            debug!("[LobbySync] Ignoring local settings change while not host");
            return Ok(None);
        }
        self.lobby.replace(settings);
        Ok(Some(settings.to_payload()?))
    }

    /// Payload to push to a newly connected peer, read at call time.
    /// `None` when the local client is not the host.
    pub fn host_payload(&self) -> Option<String> {
        if !self.authority.is_host {
            return None;
        }
        match self.lobby.get().to_payload() {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("[LobbySync] Failed to encode lobby settings: {}", e);
                None
            }
        }
    }

    /// Handle a payload received on a peer's data channel.
    ///
    /// `sender_client_id` is the client id the relay associated with the
    /// sending connection, if any.
    pub fn receive(&mut self, sender_client_id: Option<u32>, data: &[u8]) -> ReceiveOutcome {
        if sender_client_id != Some(self.authority.host_id) {
            debug!(
                "[LobbySync] Dropping settings from client {:?}, host is {}",
                sender_client_id, self.authority.host_id
            );
            return ReceiveOutcome::Untrusted;
        }

        let payload: serde_json::Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("[LobbySync] Malformed settings payload from host: {}", e);
                return ReceiveOutcome::Malformed;
            }
        };

        let mut result = Ok(());
        let previous = self.lobby.update(|s| result = s.apply_payload(&payload));
        match result {
            Ok(()) => {
                if previous.is_some() {
                    info!("[LobbySync] Lobby settings updated by host: {:?}", self.lobby.get());
                }
                ReceiveOutcome::Applied { previous }
            }
            Err(e) => {
                warn!("[LobbySync] Rejected settings payload from host: {}", e);
                ReceiveOutcome::Malformed
            }
        }
    }

    /// Joining a lobby as guest: drop everything a legacy host may never send
    pub fn joined_as_guest(&mut self) -> Option<LobbySettings> {
        self.lobby.update(LobbySettings::reset_non_legacy_fields)
    }
}
