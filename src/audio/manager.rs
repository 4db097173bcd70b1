//! Registry of per-peer audio graphs.
//!
//! The manager is the only writer of the graph map; everything else looks
//! graphs up by peer id.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use super::graph::{Insert, PeerAudioGraph};
use super::stream::MediaStream;
use crate::config::SAMPLE_RATE;
use crate::dsp::{ImpulseResponse, Position};
use crate::error::GraphError;
use crate::peer::PeerId;
use crate::spatial::AudioParams;

/// Owns one [`PeerAudioGraph`] per peer with a live stream
pub struct AudioGraphManager {
    graphs: HashMap<PeerId, PeerAudioGraph>,
    impulse: ImpulseResponse,
    max_distance: f32,
    mix: Vec<f32>,
}

impl AudioGraphManager {
    pub fn new(max_distance: f32) -> Self {
        Self {
            graphs: HashMap::new(),
            impulse: ImpulseResponse::synthetic(SAMPLE_RATE),
            max_distance,
            mix: Vec::new(),
        }
    }

    /// Build the initial graph for a peer's stream.
    /// An existing graph for the same peer is torn down first.
    pub fn create(&mut self, peer: &PeerId, stream: Arc<MediaStream>) {
        if let Some(mut old) = self.graphs.remove(peer) {
            warn!("[AudioGraph] Replacing existing graph for peer {}", peer);
            old.teardown();
        }
        let graph = PeerAudioGraph::new(stream, self.max_distance, self.impulse.clone());
        self.graphs.insert(peer.clone(), graph);
        info!("[AudioGraph] Created graph for peer {}", peer);
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.graphs.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerAudioGraph> {
        self.graphs.get(peer)
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.graphs.keys()
    }

    /// Current gain of a peer's graph
    pub fn gain(&self, peer: &PeerId) -> Option<f32> {
        self.graphs.get(peer).map(PeerAudioGraph::gain)
    }

    /// Apply one tick's parameters to a peer's graph.
    ///
    /// Gain and pan are always applied; a failed insert transition is
    /// returned after the rest of the parameters have been set.
    pub fn apply(&mut self, peer: &PeerId, params: &AudioParams) -> Result<(), GraphError> {
        let graph = self.graphs.get_mut(peer).ok_or(GraphError::TornDown)?;

        graph.set_gain(params.gain);
        if let Some([x, y, z]) = params.pan {
            graph.set_pan(Position::new(x, y, z));
        }
        if let Some(muffle) = params.muffle {
            graph.set_muffle_params(muffle);
        }

        let reverb = graph.set_insert(Insert::Reverb, params.reverb);
        let muffle = graph.set_insert(Insert::Muffle, params.muffle.is_some());
        for (insert, result) in [(Insert::Reverb, &reverb), (Insert::Muffle, &muffle)] {
            if let Ok(true) = result {
                debug!("[AudioGraph] Peer {} {:?} -> {:?}", peer, insert, graph.insert_state(insert));
            }
        }
        reverb?;
        muffle?;
        Ok(())
    }

    /// Hearing range changed in the lobby settings
    pub fn set_max_distance(&mut self, max_distance: f32) {
        self.max_distance = max_distance;
        for graph in self.graphs.values_mut() {
            graph.set_max_distance(max_distance);
        }
    }

    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    /// Install a decoded impulse response in every current and future graph
    pub fn set_impulse(&mut self, impulse: ImpulseResponse) {
        for graph in self.graphs.values_mut() {
            graph.set_impulse(impulse.clone());
        }
        self.impulse = impulse;
    }

    /// Release everything held for a peer.
    /// Returns false if there was nothing to release.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        match self.graphs.remove(peer) {
            Some(mut graph) => {
                graph.teardown();
                info!("[AudioGraph] Released graph for peer {}", peer);
                true
            }
            None => false,
        }
    }

    /// Release every graph
    pub fn clear(&mut self) {
        let peers: Vec<PeerId> = self.graphs.keys().cloned().collect();
        for peer in peers {
            self.remove(&peer);
        }
    }

    /// Mix every peer's sink into one interleaved stereo block for the
    /// playback device.
    pub fn render(&mut self, frames: usize) -> &[f32] {
        self.mix.clear();
        self.mix.resize(frames * 2, 0.0);
        for graph in self.graphs.values_mut() {
            for (out, s) in self.mix.iter_mut().zip(graph.render(frames)) {
                *out += s;
            }
        }
        &self.mix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::graph::MuffleParams;

    fn params(gain: f32) -> AudioParams {
        AudioParams {
            gain,
            pan: Some([1.0, 0.0, -0.5]),
            reverb: false,
            muffle: None,
        }
    }

    #[test]
    fn test_apply_sets_gain_pan_and_inserts() {
        let mut mgr = AudioGraphManager::new(5.32);
        let peer = PeerId::from("a");
        let (stream, _w) = MediaStream::new(1024);
        mgr.create(&peer, stream);

        let mut p = params(0.2);
        p.reverb = true;
        p.muffle = Some(MuffleParams::default());
        mgr.apply(&peer, &p).unwrap();

        let g = mgr.get(&peer).unwrap();
        assert_eq!(g.gain(), 0.2);
        assert_eq!(g.pan(), Position::new(1.0, 0.0, -0.5));
        assert!(g.reverb_active() && g.muffle_active());

        mgr.apply(&peer, &params(1.0)).unwrap();
        let g = mgr.get(&peer).unwrap();
        assert!(!g.reverb_active() && !g.muffle_active());
    }

    #[test]
    fn test_skipped_pan_keeps_position() {
        let mut mgr = AudioGraphManager::new(5.32);
        let peer = PeerId::from("a");
        let (stream, _w) = MediaStream::new(1024);
        mgr.create(&peer, stream);
        mgr.apply(&peer, &params(1.0)).unwrap();

        let mut p = params(0.0);
        p.pan = None;
        mgr.apply(&peer, &p).unwrap();
        assert_eq!(mgr.get(&peer).unwrap().pan(), Position::new(1.0, 0.0, -0.5));
    }

    #[test]
    fn test_apply_to_missing_peer_is_an_error() {
        let mut mgr = AudioGraphManager::new(5.32);
        assert!(mgr.apply(&PeerId::from("ghost"), &params(1.0)).is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut mgr = AudioGraphManager::new(5.32);
        let peer = PeerId::from("a");
        let (stream, _w) = MediaStream::new(1024);
        mgr.create(&peer, stream.clone());

        assert!(mgr.remove(&peer));
        assert!(stream.is_stopped());
        assert!(!mgr.remove(&peer));
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_max_distance_follows_settings() {
        let mut mgr = AudioGraphManager::new(5.32);
        let peer = PeerId::from("a");
        let (stream, _w) = MediaStream::new(1024);
        mgr.create(&peer, stream);
        mgr.set_max_distance(2.0);
        assert_eq!(mgr.get(&peer).unwrap().max_distance(), 2.0);

        let (stream, _w) = MediaStream::new(1024);
        mgr.create(&PeerId::from("b"), stream);
        assert_eq!(mgr.get(&PeerId::from("b")).unwrap().max_distance(), 2.0);
    }

    #[test]
    fn test_render_mixes_peers() {
        let mut mgr = AudioGraphManager::new(5.32);
        for id in ["a", "b"] {
            let (stream, mut w) = MediaStream::new(1024);
            w.write(&[0.5; 64]);
            let peer = PeerId::from(id);
            mgr.create(&peer, stream);
            let mut p = params(1.0);
            p.pan = Some([0.0, 0.0, -0.5]);
            mgr.apply(&peer, &p).unwrap();
        }
        let mixed = mgr.render(64).to_vec();
        assert_eq!(mixed.len(), 128);
        assert!(mixed[126] > 0.0);
    }
}
