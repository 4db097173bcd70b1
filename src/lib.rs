//! proximity-voice: proximity voice chat driven by game state.
//!
//! Players in the same lobby form a full WebRTC mesh introduced by a relay
//! server. Every game-state tick recomputes each remote player's volume,
//! stereo position and effects from positions, life state and lobby rules.
//!
//! ## Features
//!
//! - **Relay signaling**: join/leave, offer/answer/candidate forwarding, client directory
//! - **Peer mesh**: one session per peer, ICE restart on failure, lobby settings over data channels
//! - **Spatial audio**: per-peer gain, equal-power panning, muffle low-pass and reverb inserts
//! - **Host authority**: lobby rules only accepted from the lobby host
//! - **OPUS codec**: 48kHz stereo, 20ms frames
//! - **Input gating**: mute, deafen and push-to-talk on the outgoing track

pub mod audio;
pub mod codec;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod game;
pub mod ice;
pub mod input;
pub mod lobby;
pub mod overlay;
pub mod peer;
pub mod signaling;
pub mod spatial;

pub use config::UserSettings;
pub use engine::{EngineEvent, EngineHandle, EngineNotification, VoiceEngine};
pub use error::{EngineError, GraphError, PeerError, SettingsError, SignalingError};
pub use game::{GamePhase, GameState, Player};
pub use lobby::{LobbySettings, LobbySettingsSync};
pub use peer::{PeerId, PeerSessionManager, RtcConnector};
pub use signaling::{SignalingClient, SignalingEvent};
