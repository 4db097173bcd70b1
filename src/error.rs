//! Error types for the voice engine.

use thiserror::Error;

use crate::peer::PeerId;

/// Errors from the relay/signaling connection
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid relay server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to connect to relay server: {0}")]
    Connect(String),

    #[error("Relay connection is closed")]
    Closed,

    #[error("Failed to encode relay message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reasons a server-provided ICE configuration is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerConfigError {
    #[error("Server sent a malformed peer config:\n{}", .0.join("\n"))]
    Malformed(Vec<String>),

    #[error("Server has forced relay mode enabled but provides no relay servers")]
    RelayOnlyWithoutRelay,
}

/// Errors from a single peer connection
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    #[error("Signaling payload rejected: {0}")]
    Signal(String),

    #[error("Data channel not available for peer {0}")]
    NoDataChannel(PeerId),

    #[error("Failed to send data: {0}")]
    Send(String),

    #[error("No session for peer {0}")]
    UnknownPeer(PeerId),
}

/// Errors raised when rewiring a peer's audio graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{0} is already spliced into the signal path")]
    AlreadySpliced(&'static str),

    #[error("{0} is not spliced into the signal path")]
    NotSpliced(&'static str),

    #[error("{from} is not connected to {to}")]
    NotConnected { from: &'static str, to: &'static str },

    #[error("{from} already feeds {to}")]
    OutputInUse { from: &'static str, to: &'static str },

    #[error("Graph for peer has been torn down")]
    TornDown,
}

/// Errors while parsing settings payloads and assets
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings payload is not a JSON object")]
    NotAnObject,

    #[error("Failed to decode impulse response: {0}")]
    ImpulseDecode(String),
}

/// Engine-level failures
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Couldn't connect to your microphone:\n{0}")]
    Microphone(String),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("Engine event channel closed")]
    ChannelClosed,
}
