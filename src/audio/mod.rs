//! Remote audio: media streams, per-peer graphs and their registry.

pub mod graph;
pub mod manager;
pub mod stream;

pub use graph::{Insert, InsertState, MuffleParams, NodeId, PeerAudioGraph};
pub use manager::AudioGraphManager;
pub use stream::{MediaStream, MediaTrack, StreamWriter};
