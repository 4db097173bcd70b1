//! webrtc-rs backend for [`PeerConnector`].
//!
//! Every connection runs in its own task that owns the `RTCPeerConnection`
//! and applies queued commands one at a time. All connections share a single
//! outgoing Opus track fed from the local microphone.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::connection::{LinkRequest, PeerConnector, PeerEvent, PeerEventCallback, PeerEventKind, PeerLink, SessionToken};
use super::PeerId;
use crate::audio::stream::{available, read_or_silence};
use crate::audio::{MediaStream, StreamWriter};
use crate::codec::{AudioFormat, VoiceDecoder, VoiceEncoder};
use crate::config::{FRAME_MS, SAMPLE_RATE};
use crate::error::PeerError;
use crate::signaling::{CandidateInit, SignalPayload};

/// Decoded remote audio buffered per peer (500 ms)
const REMOTE_BUFFER_SAMPLES: usize = SAMPLE_RATE as usize / 2;

/// Label of the settings data channel
const DATA_CHANNEL_LABEL: &str = "data";

type DataChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

enum Command {
    Signal(SignalPayload),
    Send(String),
    RestartIce,
    Close,
}

/// Tags events with the session they belong to
#[derive(Clone)]
struct Emitter {
    peer: PeerId,
    session: SessionToken,
    events: PeerEventCallback,
}

impl Emitter {
    fn new(request: &LinkRequest) -> Self {
        Self {
            peer: request.peer.clone(),
            session: request.session,
            events: request.events.clone(),
        }
    }

    fn emit(&self, kind: PeerEventKind) {
        (self.events)(PeerEvent {
            peer: self.peer.clone(),
            session: self.session,
            kind,
        });
    }
}

/// Opens webrtc-rs connections that all send the local microphone
pub struct RtcConnector {
    api: Arc<API>,
    shared_track: Arc<TrackLocalStaticSample>,
    microphone_pump: Option<JoinHandle<()>>,
}

impl RtcConnector {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Create(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::Create(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let shared_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "proximity-voice".to_owned(),
        ));

        Ok(Self {
            api: Arc::new(api),
            shared_track,
            microphone_pump: None,
        })
    }

    /// Get the shared outgoing audio track
    pub fn shared_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.shared_track
    }
}

impl PeerConnector for RtcConnector {
    fn open(&self, request: LinkRequest) -> Result<Box<dyn PeerLink>, PeerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PeerError::Create(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let data_channel: DataChannelSlot = Arc::new(Mutex::new(None));

        info!(
            "[PeerSession] Opening connection to {} ({})",
            request.peer,
            if request.initiator { "offerer" } else { "answerer" }
        );

        let peer = request.peer.clone();
        runtime.spawn(run_link(
            self.api.clone(),
            self.shared_track.clone(),
            request,
            data_channel.clone(),
            rx,
        ));

        Ok(Box::new(RtcLink {
            peer,
            commands: tx,
            data_channel,
        }))
    }

    fn attach_microphone(&mut self, stream: Arc<MediaStream>) {
        if let Some(pump) = self.microphone_pump.take() {
            pump.abort();
        }
        let Some(source) = stream.take_source() else {
            warn!("[PeerSession] Microphone stream has no readable source");
            return;
        };
        self.microphone_pump = Some(tokio::spawn(pump_microphone(
            stream,
            source,
            self.shared_track.clone(),
        )));
    }
}

impl Drop for RtcConnector {
    fn drop(&mut self) {
        if let Some(pump) = self.microphone_pump.take() {
            pump.abort();
        }
    }
}

/// Handle to a connection task
struct RtcLink {
    peer: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    data_channel: DataChannelSlot,
}

impl PeerLink for RtcLink {
    fn signal(&self, payload: SignalPayload) {
        let _ = self.commands.send(Command::Signal(payload));
    }

    fn send(&self, data: &str) -> Result<(), PeerError> {
        let open = self
            .data_channel
            .lock()
            .as_ref()
            .map_or(false, |dc| dc.ready_state() == RTCDataChannelState::Open);
        if !open {
            return Err(PeerError::NoDataChannel(self.peer.clone()));
        }
        self.commands
            .send(Command::Send(data.to_string()))
            .map_err(|_| PeerError::Send("connection closed".to_string()))
    }

    fn restart_ice(&self) {
        let _ = self.commands.send(Command::RestartIce);
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Candidates that arrive before the remote description
#[derive(Default)]
struct Negotiation {
    remote_description_set: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

async fn run_link(
    api: Arc<API>,
    shared_track: Arc<TrackLocalStaticSample>,
    request: LinkRequest,
    data_channel: DataChannelSlot,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let emitter = Emitter::new(&request);

    let pc = match create_peer_connection(&api, &shared_track, &request, &emitter, &data_channel).await {
        Ok(pc) => pc,
        Err(e) => {
            warn!("[PeerSession] {}: {}", request.peer, e);
            emitter.emit(PeerEventKind::Error(e.to_string()));
            emitter.emit(PeerEventKind::Closed);
            return;
        }
    };

    if request.initiator {
        if let Err(e) = send_offer(&pc, &emitter, false).await {
            warn!("[PeerSession] {}: {}", request.peer, e);
            emitter.emit(PeerEventKind::Error(e.to_string()));
        }
    }

    let mut negotiation = Negotiation::default();
    while let Some(command) = commands.recv().await {
        let result = match command {
            Command::Signal(payload) => apply_signal(&pc, &emitter, &mut negotiation, payload).await,
            Command::Send(text) => send_text(&data_channel, text).await,
            Command::RestartIce => send_offer(&pc, &emitter, true).await,
            Command::Close => break,
        };
        if let Err(e) = result {
            warn!("[PeerSession] {}: {}", request.peer, e);
            emitter.emit(PeerEventKind::Error(e.to_string()));
        }
    }

    data_channel.lock().take();
    if let Err(e) = pc.close().await {
        warn!("[PeerSession] Failed to close connection to {}: {}", request.peer, e);
    }
    debug!("[PeerSession] Connection task for {} finished", request.peer);
}

/// Create the RTCPeerConnection and wire its callbacks to the emitter
async fn create_peer_connection(
    api: &API,
    shared_track: &Arc<TrackLocalStaticSample>,
    request: &LinkRequest,
    emitter: &Emitter,
    data_channel: &DataChannelSlot,
) -> Result<Arc<RTCPeerConnection>, PeerError> {
    let pc = api
        .new_peer_connection(request.ice.to_rtc_configuration())
        .await
        .map_err(|e| PeerError::Create(e.to_string()))?;
    let pc = Arc::new(pc);

    pc.add_track(shared_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| PeerError::Create(format!("Failed to add track: {}", e)))?;

    let ice_emitter = emitter.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let emitter = ice_emitter.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                return;
            };
            match c.to_json() {
                Ok(init) => emitter.emit(PeerEventKind::Signal(SignalPayload::Candidate {
                    candidate: CandidateInit {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    },
                })),
                Err(e) => warn!("[PeerSession] Failed to serialize ICE candidate: {}", e),
            }
        })
    }));

    let state_emitter = emitter.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!("[PeerSession] {} connection state: {:?}", state_emitter.peer, state);
        match state {
            RTCPeerConnectionState::Connected => state_emitter.emit(PeerEventKind::Connected),
            RTCPeerConnectionState::Failed => {
                state_emitter.emit(PeerEventKind::Error("WebRTC connection failed".to_string()))
            }
            RTCPeerConnectionState::Closed => state_emitter.emit(PeerEventKind::Closed),
            _ => {}
        }
        Box::pin(async {})
    }));

    let ice_state_emitter = emitter.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if state == RTCIceConnectionState::Failed {
            ice_state_emitter.emit(PeerEventKind::IceFailed);
        }
        Box::pin(async {})
    }));

    let track_emitter = emitter.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let codec = track.codec();
            if !codec.capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
                return Box::pin(async {});
            }

            let (stream, writer) = MediaStream::new(REMOTE_BUFFER_SAMPLES);
            track_emitter.emit(PeerEventKind::Stream(stream));

            let peer = track_emitter.peer.clone();
            Box::pin(async move {
                tokio::spawn(spawn_track_reader(peer, track, writer));
            })
        },
    ));

    if request.initiator {
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| PeerError::Create(format!("Failed to create data channel: {}", e)))?;
        attach_data_channel(dc, emitter, data_channel);
    } else {
        let dc_emitter = emitter.clone();
        let slot = data_channel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            attach_data_channel(dc, &dc_emitter, &slot);
            Box::pin(async {})
        }));
    }

    Ok(pc)
}

fn attach_data_channel(dc: Arc<RTCDataChannel>, emitter: &Emitter, slot: &DataChannelSlot) {
    let emitter = emitter.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        emitter.emit(PeerEventKind::Data(msg.data.to_vec()));
        Box::pin(async {})
    }));
    *slot.lock() = Some(dc);
}

/// Create an offer, apply it locally and relay it
async fn send_offer(pc: &RTCPeerConnection, emitter: &Emitter, ice_restart: bool) -> Result<(), PeerError> {
    let options = ice_restart.then(|| RTCOfferOptions {
        ice_restart: true,
        ..Default::default()
    });
    let offer = pc
        .create_offer(options)
        .await
        .map_err(|e| PeerError::Signal(format!("Failed to create offer: {}", e)))?;
    pc.set_local_description(offer.clone())
        .await
        .map_err(|e| PeerError::Signal(format!("Failed to set local description: {}", e)))?;

    if ice_restart {
        info!("[PeerSession] Restarting ICE with {}", emitter.peer);
    }
    emitter.emit(PeerEventKind::Signal(SignalPayload::Offer { sdp: offer.sdp }));
    Ok(())
}

async fn apply_signal(
    pc: &RTCPeerConnection,
    emitter: &Emitter,
    negotiation: &mut Negotiation,
    payload: SignalPayload,
) -> Result<(), PeerError> {
    match payload {
        SignalPayload::Offer { sdp } => {
            let offer = RTCSessionDescription::offer(sdp)
                .map_err(|e| PeerError::Signal(format!("Invalid offer SDP: {}", e)))?;
            pc.set_remote_description(offer)
                .await
                .map_err(|e| PeerError::Signal(format!("Failed to set remote description: {}", e)))?;
            flush_candidates(pc, negotiation).await;

            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| PeerError::Signal(format!("Failed to create answer: {}", e)))?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(|e| PeerError::Signal(format!("Failed to set local description: {}", e)))?;
            emitter.emit(PeerEventKind::Signal(SignalPayload::Answer { sdp: answer.sdp }));
        }
        SignalPayload::Answer { sdp } => {
            let answer = RTCSessionDescription::answer(sdp)
                .map_err(|e| PeerError::Signal(format!("Invalid answer SDP: {}", e)))?;
            pc.set_remote_description(answer)
                .await
                .map_err(|e| PeerError::Signal(format!("Failed to set remote description: {}", e)))?;
            flush_candidates(pc, negotiation).await;
        }
        SignalPayload::Candidate { candidate } => {
            if candidate.candidate.is_empty() {
                return Ok(());
            }
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            };
            if negotiation.remote_description_set {
                pc.add_ice_candidate(init)
                    .await
                    .map_err(|e| PeerError::Signal(format!("Failed to add ICE candidate: {}", e)))?;
            } else {
                negotiation.pending_candidates.push(init);
            }
        }
    }
    Ok(())
}

async fn flush_candidates(pc: &RTCPeerConnection, negotiation: &mut Negotiation) {
    negotiation.remote_description_set = true;
    for candidate in negotiation.pending_candidates.drain(..) {
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!("[PeerSession] Failed to add queued ICE candidate: {}", e);
        }
    }
}

async fn send_text(slot: &DataChannelSlot, text: String) -> Result<(), PeerError> {
    let dc = slot
        .lock()
        .clone()
        .ok_or_else(|| PeerError::Send("data channel closed".to_string()))?;
    dc.send_text(text)
        .await
        .map_err(|e| PeerError::Send(e.to_string()))?;
    Ok(())
}

/// Read RTP from a remote track and decode Opus into the peer's stream.
/// Ends when the track closes or the stream is stopped by graph teardown.
async fn spawn_track_reader(peer: PeerId, track: Arc<TrackRemote>, mut writer: StreamWriter) {
    let mut decoder = match VoiceDecoder::new(AudioFormat::voice()) {
        Ok(d) => d,
        Err(e) => {
            warn!("[PeerSession] Failed to create Opus decoder for {}: {}", peer, e);
            return;
        }
    };

    while !writer.is_stopped() {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                let payload = packet.payload.as_ref();
                if payload.is_empty() {
                    continue;
                }
                match decoder.decode(payload) {
                    Ok(pcm) => {
                        writer.write(pcm);
                    }
                    Err(e) => debug!("[PeerSession] Dropping undecodable packet from {}: {}", peer, e),
                }
            }
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("eof") || err_str.contains("closed") {
                    break;
                }
                warn!("[PeerSession] RTP read error from {}: {}", peer, e);
            }
        }
    }
    debug!("[PeerSession] Track reader for {} finished", peer);
}

/// Encode the microphone in 20 ms frames onto the shared track
async fn pump_microphone(
    stream: Arc<MediaStream>,
    mut source: ringbuf::HeapCons<f32>,
    shared_track: Arc<TrackLocalStaticSample>,
) {
    let mut encoder = match VoiceEncoder::new(AudioFormat::voice()) {
        Ok(e) => e,
        Err(e) => {
            warn!("[PeerSession] Failed to create Opus encoder: {}", e);
            return;
        }
    };

    let frame_duration = Duration::from_millis(FRAME_MS as u64);
    let mut frame = vec![0.0f32; encoder.frame_samples()];
    let mut ticker = tokio::time::interval(frame_duration);

    while !stream.is_stopped() {
        ticker.tick().await;
        if available(&source) < frame.len() {
            continue;
        }
        read_or_silence(&mut source, &mut frame);

        let data = match encoder.encode(&frame) {
            Ok(packet) => Bytes::copy_from_slice(packet),
            Err(e) => {
                debug!("[PeerSession] Microphone encode error: {}", e);
                continue;
            }
        };
        let sample = Sample {
            data,
            duration: frame_duration,
            ..Default::default()
        };
        if let Err(e) = shared_track.write_sample(&sample).await {
            debug!("[PeerSession] Failed to write microphone sample: {}", e);
        }
    }
    info!("[PeerSession] Microphone stream stopped");
}
