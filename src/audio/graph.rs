//! Per-peer audio graph.
//!
//! ```text
//! source -> panner -> gain -> [reverb] -> [muffle] -> sink
//! ```
//!
//! Every node has at most one output. Optional inserts are spliced between
//! the sink and whatever currently feeds it, and removed by reconnecting
//! their upstream to their downstream. The per-insert [`InsertState`] is
//! the only thing splice/unsplice consult.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use ringbuf::HeapCons;

use super::stream::{read_or_silence, MediaStream};
use crate::config::{
    GAIN_RAMP_MS, MUFFLE_FREQUENCY, MUFFLE_Q, PANNER_REF_DISTANCE, PANNER_ROLLOFF, SAMPLE_RATE,
};
use crate::dsp::{Biquad, Convolver, EqualPowerPanner, GainRamp, ImpulseResponse, Position};
use crate::error::GraphError;

/// Nodes of a peer graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Source,
    Panner,
    Gain,
    Reverb,
    Muffle,
    Sink,
}

impl NodeId {
    pub fn name(self) -> &'static str {
        match self {
            NodeId::Source => "source",
            NodeId::Panner => "panner",
            NodeId::Gain => "gain",
            NodeId::Reverb => "reverb",
            NodeId::Muffle => "muffle",
            NodeId::Sink => "sink",
        }
    }
}

/// Optional effect nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Insert {
    Reverb,
    Muffle,
}

impl Insert {
    fn node(self) -> NodeId {
        match self {
            Insert::Reverb => NodeId::Reverb,
            Insert::Muffle => NodeId::Muffle,
        }
    }
}

/// Whether an insert is currently in the signal path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertState {
    #[default]
    Absent,
    Active,
}

/// Low-pass parameters of the muffle insert
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MuffleParams {
    /// Cutoff frequency (Hz)
    pub frequency: f32,
    /// Resonance (dB)
    pub q: f32,
}

impl Default for MuffleParams {
    fn default() -> Self {
        Self {
            frequency: MUFFLE_FREQUENCY,
            q: MUFFLE_Q,
        }
    }
}

/// Signal graph for one remote peer
pub struct PeerAudioGraph {
    stream: Arc<MediaStream>,
    source: Option<HeapCons<f32>>,
    panner: EqualPowerPanner,
    gain: GainRamp,
    reverb: Convolver,
    muffle: Biquad,
    muffle_params: MuffleParams,
    reverb_state: InsertState,
    muffle_state: InsertState,
    /// node -> the node it outputs to
    edges: HashMap<NodeId, NodeId>,
    mono: Vec<f32>,
    sink: Vec<f32>,
    torn_down: bool,
}

impl PeerAudioGraph {
    /// Build the base chain for a remote stream. Starts silent.
    pub fn new(stream: Arc<MediaStream>, max_distance: f32, impulse: ImpulseResponse) -> Self {
        let source = stream.take_source();
        if source.is_none() {
            debug!("[AudioGraph] Stream source already taken, graph will render silence");
        }
        let muffle_params = MuffleParams::default();
        let mut graph = Self {
            stream,
            source,
            panner: EqualPowerPanner::new(PANNER_REF_DISTANCE, max_distance, PANNER_ROLLOFF),
            gain: GainRamp::new(0.0, GAIN_RAMP_MS, SAMPLE_RATE),
            reverb: Convolver::new(impulse),
            muffle: Biquad::lowpass_resonant(
                muffle_params.frequency,
                muffle_params.q,
                SAMPLE_RATE as f32,
            ),
            muffle_params,
            reverb_state: InsertState::Absent,
            muffle_state: InsertState::Absent,
            edges: HashMap::new(),
            mono: Vec::new(),
            sink: Vec::new(),
            torn_down: false,
        };
        graph.edges.insert(NodeId::Source, NodeId::Panner);
        graph.edges.insert(NodeId::Panner, NodeId::Gain);
        graph.edges.insert(NodeId::Gain, NodeId::Sink);
        graph
    }

    fn check_live(&self) -> Result<(), GraphError> {
        if self.torn_down {
            Err(GraphError::TornDown)
        } else {
            Ok(())
        }
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        if let Some(existing) = self.edges.get(&from) {
            return Err(GraphError::OutputInUse {
                from: from.name(),
                to: existing.name(),
            });
        }
        self.edges.insert(from, to);
        Ok(())
    }

    fn disconnect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        if self.edges.get(&from) != Some(&to) {
            return Err(GraphError::NotConnected {
                from: from.name(),
                to: to.name(),
            });
        }
        self.edges.remove(&from);
        Ok(())
    }

    /// Node feeding `node`, if any
    fn upstream_of(&self, node: NodeId) -> Option<NodeId> {
        self.edges
            .iter()
            .find_map(|(from, to)| (*to == node).then_some(*from))
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.get(&from) == Some(&to)
    }

    /// Nodes visited from the source to the end of the chain
    pub fn signal_path(&self) -> Vec<NodeId> {
        let mut path = vec![NodeId::Source];
        let mut node = NodeId::Source;
        while let Some(next) = self.edges.get(&node) {
            path.push(*next);
            node = *next;
            if path.len() > 6 {
                break;
            }
        }
        path
    }

    pub fn insert_state(&self, insert: Insert) -> InsertState {
        match insert {
            Insert::Reverb => self.reverb_state,
            Insert::Muffle => self.muffle_state,
        }
    }

    fn set_insert_state(&mut self, insert: Insert, state: InsertState) {
        match insert {
            Insert::Reverb => self.reverb_state = state,
            Insert::Muffle => self.muffle_state = state,
        }
    }

    pub fn reverb_active(&self) -> bool {
        self.reverb_state == InsertState::Active
    }

    pub fn muffle_active(&self) -> bool {
        self.muffle_state == InsertState::Active
    }

    /// Put an insert in front of the sink.
    /// Fails if it is already spliced.
    pub fn splice(&mut self, insert: Insert) -> Result<(), GraphError> {
        self.check_live()?;
        let node = insert.node();
        if self.insert_state(insert) == InsertState::Active {
            return Err(GraphError::AlreadySpliced(node.name()));
        }
        let upstream = self.upstream_of(NodeId::Sink).ok_or(GraphError::NotConnected {
            from: "any node",
            to: NodeId::Sink.name(),
        })?;

        // Never leave upstream feeding two paths
        self.disconnect(upstream, NodeId::Sink)?;
        self.connect(upstream, node)?;
        self.connect(node, NodeId::Sink)?;
        match insert {
            Insert::Reverb => self.reverb.reset(),
            Insert::Muffle => self.muffle.reset(),
        }
        self.set_insert_state(insert, InsertState::Active);
        Ok(())
    }

    /// Take an insert out of the path, joining its neighbours.
    /// Fails if it is not spliced.
    pub fn unsplice(&mut self, insert: Insert) -> Result<(), GraphError> {
        self.check_live()?;
        let node = insert.node();
        if self.insert_state(insert) == InsertState::Absent {
            return Err(GraphError::NotSpliced(node.name()));
        }
        let upstream = self.upstream_of(node).ok_or(GraphError::NotConnected {
            from: "any node",
            to: node.name(),
        })?;
        let downstream = *self.edges.get(&node).ok_or(GraphError::NotConnected {
            from: node.name(),
            to: "any node",
        })?;

        self.disconnect(upstream, node)?;
        self.disconnect(node, downstream)?;
        self.connect(upstream, downstream)?;
        self.set_insert_state(insert, InsertState::Absent);
        Ok(())
    }

    /// Guarded transition to the wanted state.
    /// Returns true if the graph was rewired.
    pub fn set_insert(&mut self, insert: Insert, active: bool) -> Result<bool, GraphError> {
        let want = if active {
            InsertState::Active
        } else {
            InsertState::Absent
        };
        if self.insert_state(insert) == want {
            return Ok(false);
        }
        if active {
            self.splice(insert)?;
        } else {
            self.unsplice(insert)?;
        }
        Ok(true)
    }

    /// Gain the graph is heading to
    pub fn gain(&self) -> f32 {
        self.gain.target()
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain.set_target(gain);
    }

    pub fn pan(&self) -> Position {
        self.panner.position()
    }

    pub fn set_pan(&mut self, position: Position) {
        self.panner.set_position(position);
    }

    pub fn max_distance(&self) -> f32 {
        self.panner.max_distance()
    }

    pub fn set_max_distance(&mut self, max_distance: f32) {
        self.panner.set_max_distance(max_distance);
    }

    pub fn muffle_params(&self) -> MuffleParams {
        self.muffle_params
    }

    pub fn set_muffle_params(&mut self, params: MuffleParams) {
        if params != self.muffle_params {
            self.muffle_params = params;
            self.muffle
                .set_lowpass_resonant(params.frequency, params.q, SAMPLE_RATE as f32);
        }
    }

    pub fn set_impulse(&mut self, impulse: ImpulseResponse) {
        self.reverb.set_impulse(impulse);
    }

    pub fn stream(&self) -> &Arc<MediaStream> {
        &self.stream
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Pull `frames` samples through the graph. Returns the interleaved
    /// stereo sink buffer; silence if the chain does not reach the sink.
    pub fn render(&mut self, frames: usize) -> &[f32] {
        self.mono.resize(frames, 0.0);
        self.sink.resize(frames * 2, 0.0);

        let Some(source) = self.source.as_mut().filter(|_| !self.torn_down) else {
            self.sink.iter_mut().for_each(|s| *s = 0.0);
            return &self.sink;
        };
        read_or_silence(source, &mut self.mono);

        let mut node = NodeId::Source;
        let mut reached_sink = false;
        while let Some(&next) = self.edges.get(&node) {
            match next {
                NodeId::Panner => self.panner.process(&self.mono, &mut self.sink),
                NodeId::Gain => self.gain.process_stereo(&mut self.sink),
                NodeId::Reverb => self.reverb.process_stereo(&mut self.sink),
                NodeId::Muffle => self.muffle.process_stereo(&mut self.sink),
                NodeId::Sink => {
                    reached_sink = true;
                    break;
                }
                NodeId::Source => break,
            }
            node = next;
        }
        if !reached_sink {
            self.sink.iter_mut().for_each(|s| *s = 0.0);
        }
        &self.sink
    }

    /// Disconnect every node, stop the stream and drop the source.
    /// Returns false if the graph was already torn down.
    pub fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        self.edges.clear();
        self.reverb_state = InsertState::Absent;
        self.muffle_state = InsertState::Absent;
        self.source = None;
        let stopped = self.stream.stop();
        debug!("[AudioGraph] Torn down, stopped {} track(s)", stopped);
        true
    }
}

impl Drop for PeerAudioGraph {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> PeerAudioGraph {
        let (stream, _writer) = MediaStream::new(4096);
        PeerAudioGraph::new(stream, 5.32, ImpulseResponse::from_channels(vec![1.0], None))
    }

    #[test]
    fn test_base_chain() {
        let g = graph();
        assert_eq!(
            g.signal_path(),
            vec![NodeId::Source, NodeId::Panner, NodeId::Gain, NodeId::Sink]
        );
        assert_eq!(g.gain(), 0.0);
    }

    #[test]
    fn test_splice_and_unsplice() {
        let mut g = graph();
        g.splice(Insert::Reverb).unwrap();
        assert!(g.reverb_active());
        assert!(!g.is_connected(NodeId::Gain, NodeId::Sink));
        assert_eq!(
            g.signal_path(),
            vec![NodeId::Source, NodeId::Panner, NodeId::Gain, NodeId::Reverb, NodeId::Sink]
        );

        g.unsplice(Insert::Reverb).unwrap();
        assert!(!g.reverb_active());
        assert_eq!(
            g.signal_path(),
            vec![NodeId::Source, NodeId::Panner, NodeId::Gain, NodeId::Sink]
        );
    }

    #[test]
    fn test_double_splice_rejected() {
        let mut g = graph();
        g.splice(Insert::Muffle).unwrap();
        assert_eq!(g.splice(Insert::Muffle), Err(GraphError::AlreadySpliced("muffle")));
        assert_eq!(g.unsplice(Insert::Reverb), Err(GraphError::NotSpliced("reverb")));
        assert_eq!(g.signal_path().len(), 5);
    }

    #[test]
    fn test_both_inserts_stay_serial() {
        let mut g = graph();
        g.set_insert(Insert::Reverb, true).unwrap();
        g.set_insert(Insert::Muffle, true).unwrap();
        assert_eq!(
            g.signal_path(),
            vec![
                NodeId::Source,
                NodeId::Panner,
                NodeId::Gain,
                NodeId::Reverb,
                NodeId::Muffle,
                NodeId::Sink
            ]
        );

        // Remove the inner one first
        g.set_insert(Insert::Reverb, false).unwrap();
        assert_eq!(
            g.signal_path(),
            vec![NodeId::Source, NodeId::Panner, NodeId::Gain, NodeId::Muffle, NodeId::Sink]
        );
        g.set_insert(Insert::Muffle, false).unwrap();
        assert_eq!(g.signal_path().len(), 4);
    }

    #[test]
    fn test_set_insert_is_idempotent() {
        let mut g = graph();
        assert!(g.set_insert(Insert::Muffle, true).unwrap());
        assert!(!g.set_insert(Insert::Muffle, true).unwrap());
        assert!(g.set_insert(Insert::Muffle, false).unwrap());
        assert!(!g.set_insert(Insert::Muffle, false).unwrap());
    }

    #[test]
    fn test_render_applies_gain_and_pan() {
        let (stream, mut writer) = MediaStream::new(4096);
        let mut g =
            PeerAudioGraph::new(stream, 5.32, ImpulseResponse::from_channels(vec![1.0], None));
        g.set_pan(Position::new(0.0, 0.0, -0.5));

        writer.write(&[1.0; 960]);
        let out = g.render(960).to_vec();
        assert!(out.iter().all(|&s| s == 0.0));

        g.set_gain(1.0);
        writer.write(&[1.0; 960]);
        let out = g.render(960).to_vec();
        let last = &out[out.len() - 2..];
        assert!(last[0] > 0.0 && (last[0] - last[1]).abs() < 1e-6);
    }

    #[test]
    fn test_teardown_stops_stream_once() {
        let mut g = graph();
        let stream = g.stream().clone();
        g.splice(Insert::Reverb).unwrap();
        assert!(g.teardown());
        assert!(stream.is_stopped());
        assert!(g.signal_path() == vec![NodeId::Source]);
        assert!(!g.teardown());
        assert_eq!(g.splice(Insert::Muffle), Err(GraphError::TornDown));
        assert!(g.render(4).iter().all(|&s| s == 0.0));
    }
}
