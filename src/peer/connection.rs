//! Single peer connection seam.
//!
//! [`PeerConnector`] opens connections and [`PeerLink`] drives one of them.
//! Implementations report back through a [`PeerEventCallback`]; every event
//! carries the [`SessionToken`] of the session it belongs to so events from a
//! torn down session can be recognised and dropped.

use std::sync::Arc;

use crate::audio::MediaStream;
use crate::error::PeerError;
use crate::ice::IceConfig;
use crate::signaling::SignalPayload;

use super::PeerId;

/// Identifies one session with a peer; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(pub u64);

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Connected,
    Closed,
}

/// What happened on a connection
#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Local negotiation payload to relay to the peer
    Signal(SignalPayload),
    Connected,
    /// Remote audio arrived
    Stream(Arc<MediaStream>),
    /// Data channel message
    Data(Vec<u8>),
    /// ICE could not find a working candidate pair
    IceFailed,
    Error(String),
    Closed,
    /// Delayed settings push for this session is due
    SettingsPushDue,
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub session: SessionToken,
    pub kind: PeerEventKind,
}

/// Callback for connection events
pub type PeerEventCallback = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Everything needed to open one connection
#[derive(Clone)]
pub struct LinkRequest {
    pub peer: PeerId,
    pub session: SessionToken,
    /// We create the offer and the data channel
    pub initiator: bool,
    pub ice: IceConfig,
    pub events: PeerEventCallback,
}

/// Handle to one open connection.
///
/// Calls are queued and applied in order, so transitions for a single peer
/// never overlap.
pub trait PeerLink: Send {
    /// Feed a negotiation payload received from the peer
    fn signal(&self, payload: SignalPayload);

    /// Send a text message over the data channel
    fn send(&self, data: &str) -> Result<(), PeerError>;

    /// Renegotiate with fresh ICE credentials
    fn restart_ice(&self);

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// Opens peer connections
pub trait PeerConnector: Send {
    fn open(&self, request: LinkRequest) -> Result<Box<dyn PeerLink>, PeerError>;

    /// Local microphone stream every connection should send
    fn attach_microphone(&mut self, _stream: Arc<MediaStream>) {}
}
