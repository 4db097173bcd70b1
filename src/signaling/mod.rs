//! Relay server signaling.
//!
//! The relay introduces peers to each other, forwards their session
//! negotiation payloads, and keeps the socket-id to game-client directory.
//! It never carries audio.

pub mod client;
pub mod messages;

use std::collections::HashMap;
use std::sync::Arc;

pub use client::{relay_url, SignalingClient};
pub use messages::{CandidateInit, Client, ClientMessage, RelayFrame, ServerMessage, SignalPayload};

use crate::error::SignalingError;
use crate::ice::IceConfig;
use crate::peer::PeerId;

/// Events surfaced by the relay connection
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Transport is open
    Connected,
    /// A join request for this lobby was sent
    Joined { lobby_code: String },
    /// A peer entered the lobby after us
    PeerJoined { peer: PeerId, client: Client },
    /// Negotiation payload from a peer
    Signal { from: PeerId, data: SignalPayload },
    /// Full peer directory replacement
    ClientDirectory(HashMap<PeerId, Client>),
    /// Single directory entry update
    ClientUpdated { peer: PeerId, client: Client },
    /// ICE configuration to use for new connections
    PeerConfig(IceConfig),
    /// Non-fatal problem the user should see
    Warning(String),
    /// Error reported by the relay
    Error(String),
    /// Transport closed
    Disconnected,
}

/// Callback for relay events
pub type SignalingCallback = Arc<dyn Fn(SignalingEvent) + Send + Sync>;

/// Outgoing half of the relay connection
pub trait RelaySink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;

    /// Close the transport
    fn close(&self) {}
}
