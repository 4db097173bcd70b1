//! The voice engine event loop.
//!
//! One task owns every piece of mutable state and reacts to [`EngineEvent`]s
//! one at a time: game-state ticks, relay events, peer connection events,
//! microphone acquisition, user input and timers. Backends never touch the
//! state directly; they only send events.
//!
//! Flow of a voice session:
//! 1. The relay connection is opened and the engine task spawned
//! 2. The external capture device delivers the microphone stream
//! 3. Ticks join the lobby reported by the game and open peer sessions
//! 4. Remote streams get an audio graph; every tick recomputes its parameters
//! 5. Leaving to the menu closes every session and releases every graph

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{AudioGraphManager, MediaStream};
use crate::config::{UserSettings, SAMPLE_RATE};
use crate::dsp::ImpulseResponse;
use crate::error::EngineError;
use crate::game::{GamePhase, GameState, MENU_LOBBY_CODE};
use crate::input::{InputState, LocalInputController};
use crate::lobby::{HostAuthority, LobbySettings, LobbySettingsSync, ReceiveOutcome, SharedLobbySettings};
use crate::overlay::{VoiceState, VoiceStateTracker};
use crate::peer::{ConnectOutcome, PeerConnector, PeerEvent, PeerEventCallback, PeerId, PeerSessionManager, SessionUpdate};
use crate::signaling::{ClientMessage, RelaySink, SignalingClient, SignalingEvent};
use crate::spatial::{self, GainScaling};

/// Inputs of the engine task
#[derive(Debug)]
pub enum EngineEvent {
    /// Game-state snapshot from the poller
    GameState(GameState),
    Signaling(SignalingEvent),
    Peer(PeerEvent),
    /// Capture device opened; the stream carries the local microphone
    MicrophoneReady(Arc<MediaStream>),
    MicrophoneFailed(String),
    ToggleMute,
    ToggleDeafen,
    /// Talk key pressed or released
    PushToTalk(bool),
    /// Voice activity on the local microphone
    LocalTalking(bool),
    /// Voice activity on a peer's stream
    RemoteTalking { peer: PeerId, talking: bool },
    /// User settings edited
    SettingsChanged(UserSettings),
    /// Reverb impulse decoded
    ImpulseReady(ImpulseResponse),
    Shutdown,
}

/// Outputs of the engine task
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotification {
    VoiceState(VoiceState),
    Input(InputState),
    RelayConnected(bool),
    /// Settings in force for the current lobby changed
    LobbySettings(LobbySettings),
    /// The engine edited the user settings; the host should persist them
    UserSettings(UserSettings),
    Warning(String),
    Error(String),
}

/// Owns all state of one voice session
pub struct VoiceEngine {
    settings: UserSettings,
    relay: Arc<dyn RelaySink>,
    sessions: PeerSessionManager,
    audio: AudioGraphManager,
    lobby: LobbySettingsSync,
    lobby_version: u64,
    input: LocalInputController,
    overlay: VoiceStateTracker,
    notify: mpsc::UnboundedSender<EngineNotification>,
    game: GameState,
    local_player_id: Option<i32>,
    microphone: Option<Arc<MediaStream>>,
    fatal: Option<String>,
    other_talking: HashMap<u32, bool>,
    other_dead: HashMap<u32, bool>,
    local_talking: bool,
}

impl VoiceEngine {
    /// Build an engine. Peer events are posted back through `events`.
    pub fn new(
        settings: UserSettings,
        connector: Box<dyn PeerConnector>,
        relay: Arc<dyn RelaySink>,
        events: mpsc::UnboundedSender<EngineEvent>,
        notify: mpsc::UnboundedSender<EngineNotification>,
    ) -> Self {
        let peer_events: PeerEventCallback = Arc::new(move |event| {
            let _ = events.send(EngineEvent::Peer(event));
        });

        let mut sessions = PeerSessionManager::new(connector, relay.clone(), peer_events);
        sessions.set_force_relay(settings.nat_fix);

        let lobby = LobbySettingsSync::new(SharedLobbySettings::new(settings.local_lobby_settings));
        let lobby_version = lobby.settings().version();
        let audio = AudioGraphManager::new(lobby.settings().get().max_distance);

        Self {
            input: LocalInputController::new(settings.push_to_talk),
            settings,
            relay,
            sessions,
            audio,
            lobby,
            lobby_version,
            overlay: VoiceStateTracker::new(),
            notify,
            game: GameState::default(),
            local_player_id: None,
            microphone: None,
            fatal: None,
            other_talking: HashMap::new(),
            other_dead: HashMap::new(),
            local_talking: false,
        }
    }

    pub fn sessions(&self) -> &PeerSessionManager {
        &self.sessions
    }

    pub fn audio(&self) -> &AudioGraphManager {
        &self.audio
    }

    /// Mix every peer for the playback device
    pub fn render(&mut self, frames: usize) -> &[f32] {
        self.audio.render(frames)
    }

    pub fn lobby_settings(&self) -> LobbySettings {
        self.lobby.settings().get()
    }

    pub fn user_settings(&self) -> &UserSettings {
        &self.settings
    }

    pub fn input_state(&self) -> InputState {
        self.input.state()
    }

    /// Set when the microphone could not be opened
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    fn emit(&self, notification: EngineNotification) {
        let _ = self.notify.send(notification);
    }

    /// Process events until shutdown or until every sender is gone
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.shutdown();
    }

    /// Apply one event. Returns false once the engine should stop.
    pub fn handle(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Shutdown => return false,
            EngineEvent::MicrophoneReady(stream) => self.on_microphone(stream),
            EngineEvent::MicrophoneFailed(reason) => {
                let err = EngineError::Microphone(reason);
                error!("[Engine] {}", err);
                self.fatal = Some(err.to_string());
                self.emit(EngineNotification::Error(err.to_string()));
            }
            EngineEvent::GameState(state) => self.on_game_state(state),
            EngineEvent::Signaling(event) => self.on_signaling(event),
            EngineEvent::Peer(event) => self.on_peer_event(event),
            EngineEvent::ToggleMute => {
                let state = self.input.toggle_mute();
                self.emit(EngineNotification::Input(state));
            }
            EngineEvent::ToggleDeafen => {
                let state = self.input.toggle_deafen();
                self.emit(EngineNotification::Input(state));
                self.update_audio();
            }
            EngineEvent::PushToTalk(pressing) => {
                let state = self.input.push_to_talk(pressing);
                self.emit(EngineNotification::Input(state));
            }
            EngineEvent::LocalTalking(talking) => self.local_talking = talking,
            EngineEvent::RemoteTalking { peer, talking } => self.on_remote_talking(&peer, talking),
            EngineEvent::SettingsChanged(settings) => self.on_settings_changed(settings),
            EngineEvent::ImpulseReady(impulse) => {
                info!("[Engine] Reverb impulse loaded ({} frames)", impulse.len());
                self.audio.set_impulse(impulse);
            }
        }
        self.publish_voice_state();
        true
    }

    fn on_microphone(&mut self, stream: Arc<MediaStream>) {
        info!("[Engine] Microphone ready");
        self.fatal = None;
        if let Some(track) = stream.audio_track() {
            self.input.attach(track.clone());
        }
        self.sessions.attach_microphone(stream.clone());
        self.microphone = Some(stream);
        self.emit(EngineNotification::Input(self.input.state()));

        // Ticks seen before the microphone was ready never joined
        let lobby_code = self.game.lobby_code_or_menu().to_string();
        self.connect(&lobby_code);
    }

    fn voice_ready(&self) -> bool {
        self.microphone.is_some() && self.fatal.is_none()
    }

    /// Enter the lobby the game reports
    fn connect(&mut self, lobby_code: &str) {
        if !self.voice_ready() {
            debug!("[Engine] Deferring connect to {} until the microphone is ready", lobby_code);
            return;
        }
        let player_id = self.game.local_player().map_or(0, |p| p.id);
        let outcome = self
            .sessions
            .connect(lobby_code, player_id, self.game.client_id, self.game.is_host);

        match outcome {
            ConnectOutcome::Unchanged => {}
            ConnectOutcome::Reset { closed } => {
                self.release(&closed);
                self.other_talking.clear();
            }
            ConnectOutcome::Joined { closed, as_guest } => {
                self.release(&closed);
                if as_guest && self.lobby.joined_as_guest().is_some() {
                    debug!("[Engine] Reset settings a legacy host may not send");
                    self.sync_lobby_settings();
                }
            }
        }
    }

    /// Release audio state of closed sessions
    fn release(&mut self, peers: &[PeerId]) {
        for peer in peers {
            self.audio.remove(peer);
            if let Some(client) = self.sessions.client_of(peer) {
                self.other_talking.remove(&client.client_id);
            }
        }
    }

    fn on_game_state(&mut self, state: GameState) {
        let previous_phase = self.game.phase;
        self.game = state;
        let phase = self.game.phase;

        if let Some(me) = self.game.local_player() {
            if self.local_player_id != Some(me.id) {
                self.local_player_id = Some(me.id);
                let msg = ClientMessage::Id {
                    player_id: me.id,
                    client_id: self.game.client_id,
                };
                if let Err(e) = self.relay.send(msg) {
                    warn!("[Engine] Failed to send player id: {}", e);
                }
            }
        }

        let became_host = self.lobby.set_authority(HostAuthority {
            host_id: self.game.host_id,
            is_host: self.game.is_host,
        });
        self.sessions.set_host(self.game.is_host);
        if became_host {
            info!("[Engine] Now hosting; lobby settings become the local defaults");
            self.settings.local_lobby_settings = self.lobby.settings().get();
            self.emit(EngineNotification::UserSettings(self.settings.clone()));
        }

        let client_ids: Vec<u32> = self.game.players.iter().map(|p| p.client_id).collect();
        if self.settings.ensure_player_configs(client_ids) {
            self.emit(EngineNotification::UserSettings(self.settings.clone()));
        }

        if phase != previous_phase {
            if phase == GamePhase::Lobby {
                self.other_dead.clear();
            } else if phase != GamePhase::Tasks {
                for player in &self.game.players {
                    self.other_dead
                        .insert(player.client_id, player.is_dead || player.disconnected);
                }
            }
        }

        let lobby_code = self.game.lobby_code_or_menu().to_string();
        if lobby_code != self.sessions.current_lobby() {
            self.connect(&lobby_code);
        }

        if phase != previous_phase {
            self.on_phase_change(previous_phase, phase);
        }

        if self.settings.mobile_host && lobby_code != MENU_LOBBY_CODE {
            self.mirror_to_mobile(&lobby_code);
        }

        self.update_audio();
    }

    fn on_phase_change(&mut self, previous: GamePhase, phase: GamePhase) {
        debug!("[Engine] Phase {:?} -> {:?}", previous, phase);
        if phase == GamePhase::Lobby && previous.is_in_game() {
            if !self.game.lobby_code.is_empty() {
                let lobby_code = self.game.lobby_code.clone();
                self.connect(&lobby_code);
            }
        } else if phase == GamePhase::Menu && !matches!(previous, GamePhase::Menu | GamePhase::Unknown) {
            info!("[Engine] Left the game, closing every session");
            let closed = self.sessions.leave();
            self.release(&closed);
            self.other_dead.clear();
        }
    }

    fn mirror_to_mobile(&self, lobby_code: &str) {
        let msg = ClientMessage::Signal {
            to: format!("{}_mobile", lobby_code),
            data: json!({
                "gameState": self.game,
                "lobbySettings": self.lobby.settings().get(),
            }),
        };
        if let Err(e) = self.relay.send(msg) {
            debug!("[Engine] Failed to mirror game state: {}", e);
        }
    }

    /// Recompute every graph from the latest tick
    fn update_audio(&mut self) {
        let Some(me) = self.game.local_player() else {
            return;
        };
        let lobby = self.lobby.settings().get();

        for other in self.game.other_players() {
            let Some(peer) = self.sessions.peer_for_client(other.client_id) else {
                continue;
            };
            if !self.audio.contains(peer) {
                continue;
            }

            let mut params = spatial::calculate(&self.game, &lobby, self.settings.enable_spatial_audio, me, other);
            params.gain = spatial::scale_gain(
                params.gain,
                &GainScaling {
                    deafened: self.input.is_deafened(),
                    player_volume: self.settings.player_volume(other.client_id),
                    ghost_volume: (me.is_dead && other.is_alive()).then_some(self.settings.ghost_volume),
                },
            );

            if let Err(e) = self.audio.apply(peer, &params) {
                warn!("[Engine] Failed to update audio for {}: {}", peer, e);
            }
        }
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => self.emit(EngineNotification::RelayConnected(true)),
            SignalingEvent::Disconnected => self.emit(EngineNotification::RelayConnected(false)),
            SignalingEvent::Joined { lobby_code } => debug!("[Engine] Join sent for {}", lobby_code),
            SignalingEvent::PeerJoined { peer, client } => {
                if !self.voice_ready() {
                    debug!("[Engine] Ignoring {} joining before the microphone is ready", peer);
                    return;
                }
                // A re-join replaces the session, so the old graph goes with it
                self.release(std::slice::from_ref(&peer));
                if let Err(e) = self.sessions.peer_joined(peer.clone(), client) {
                    warn!("[Engine] Failed to connect to {}: {}", peer, e);
                }
            }
            SignalingEvent::Signal { from, data } => {
                if !self.voice_ready() {
                    debug!("[Engine] Ignoring signal from {} before the microphone is ready", from);
                    return;
                }
                if let Err(e) = self.sessions.signal(from.clone(), data) {
                    warn!("[Engine] Failed to answer {}: {}", from, e);
                }
            }
            SignalingEvent::ClientDirectory(clients) => self.sessions.set_clients(clients),
            SignalingEvent::ClientUpdated { peer, client } => self.sessions.set_client(peer, client),
            SignalingEvent::PeerConfig(config) => self.sessions.set_ice_config(config),
            SignalingEvent::Warning(message) => self.emit(EngineNotification::Warning(message)),
            SignalingEvent::Error(message) => self.emit(EngineNotification::Error(message)),
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match self.sessions.handle_event(event) {
            SessionUpdate::None | SessionUpdate::Connected(_) => {}
            SessionUpdate::StreamReady(peer, stream) => {
                self.audio.create(&peer, stream);
                self.update_audio();
            }
            SessionUpdate::Data { peer, client_id, data } => match self.lobby.receive(client_id, &data) {
                ReceiveOutcome::Applied { previous: Some(_) } => self.sync_lobby_settings(),
                ReceiveOutcome::Applied { previous: None } => {}
                ReceiveOutcome::Untrusted => debug!("[Engine] Ignored settings from non-host {}", peer),
                ReceiveOutcome::Malformed => warn!("[Engine] Malformed settings from host {}", peer),
            },
            SessionUpdate::SettingsPushDue(peer) => {
                if let Some(payload) = self.lobby.host_payload() {
                    info!("[Engine] Sending lobby settings to {}", peer);
                    if let Err(e) = self.sessions.send_data(&peer, &payload) {
                        warn!("[Engine] Failed to send lobby settings to {}: {}", peer, e);
                    }
                }
            }
            SessionUpdate::Closed(peer) => self.release(&[peer]),
        }
    }

    fn on_remote_talking(&mut self, peer: &PeerId, talking: bool) {
        let Some(client) = self.sessions.client_of(peer) else {
            debug!("[Engine] Talking event for unknown peer {}", peer);
            return;
        };
        let audible = self.audio.gain(peer).map_or(false, |gain| gain > 0.0);
        self.other_talking.insert(client.client_id, talking && audible);
    }

    fn on_settings_changed(&mut self, settings: UserSettings) {
        if settings.push_to_talk != self.settings.push_to_talk {
            let state = self.input.set_push_to_talk(settings.push_to_talk);
            self.emit(EngineNotification::Input(state));
        }
        self.sessions.set_force_relay(settings.nat_fix);

        let lobby_edit = settings.local_lobby_settings != self.settings.local_lobby_settings;
        self.settings = settings;

        if lobby_edit {
            match self.lobby.local_change(self.settings.local_lobby_settings) {
                Ok(Some(payload)) => {
                    for (peer, e) in self.sessions.broadcast(&payload) {
                        warn!("[Engine] Failed to update lobby settings on {}: {}", peer, e);
                    }
                    self.sync_lobby_settings();
                }
                Ok(None) => {}
                Err(e) => warn!("[Engine] Failed to encode lobby settings: {}", e),
            }
        }
        self.update_audio();
    }

    /// Propagate a settings change to graphs and listeners
    fn sync_lobby_settings(&mut self) {
        let version = self.lobby.settings().version();
        if version == self.lobby_version {
            return;
        }
        self.lobby_version = version;
        let settings = self.lobby.settings().get();
        if settings.max_distance != self.audio.max_distance() {
            self.audio.set_max_distance(settings.max_distance);
        }
        self.emit(EngineNotification::LobbySettings(settings));
    }

    fn publish_voice_state(&mut self) {
        let state = VoiceState {
            other_talking: self.other_talking.clone(),
            player_socket_ids: self.sessions.player_socket_ids(),
            other_dead: self.other_dead.clone(),
            socket_clients: self.sessions.clients().clone(),
            audio_connected: self.sessions.audio_connected(),
            local_talking: self.local_talking,
            local_is_alive: self.game.local_player().map_or(true, |p| p.is_alive()),
        };
        if let Some(state) = self.overlay.update(state) {
            if self.settings.enable_overlay {
                self.emit(EngineNotification::VoiceState(state));
            }
        }
    }

    /// Leave the lobby and release everything
    fn shutdown(&mut self) {
        info!("[Engine] Shutting down");
        let closed = self.sessions.leave();
        self.release(&closed);
        self.audio.clear();
        if let Some(track) = self.input.detach() {
            track.stop();
        }
        if let Some(stream) = self.microphone.take() {
            stream.stop();
        }
        self.relay.close();
    }
}

/// Handle to a running engine task
pub struct EngineHandle {
    events: mpsc::UnboundedSender<EngineEvent>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Connect to the relay in `settings` and spawn the engine task
    pub async fn start(
        settings: UserSettings,
        connector: Box<dyn PeerConnector>,
        notify: mpsc::UnboundedSender<EngineNotification>,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let signaling_tx = tx.clone();
        let client = SignalingClient::connect(
            &settings.server_url,
            Arc::new(move |event| {
                let _ = signaling_tx.send(EngineEvent::Signaling(event));
            }),
        )
        .await?;

        let engine = VoiceEngine::new(settings, connector, Arc::new(client), tx.clone(), notify);
        let task = tokio::spawn(engine.run(rx));
        Ok(Self { events: tx, task })
    }

    pub fn send(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.events.send(event).map_err(|_| EngineError::ChannelClosed)
    }

    /// Sender for collaborators that post events themselves
    pub fn sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.events.clone()
    }

    /// Decode an Ogg Vorbis impulse response off the engine task
    pub fn load_impulse(&self, data: Vec<u8>) {
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || match ImpulseResponse::from_ogg_vorbis(&data, SAMPLE_RATE) {
            Ok(impulse) => {
                let _ = events.send(EngineEvent::ImpulseReady(impulse));
            }
            Err(e) => warn!("[Engine] {}", e),
        });
    }

    /// Stop the engine and wait for it to release everything
    pub async fn shutdown(self) {
        let _ = self.events.send(EngineEvent::Shutdown);
        if let Err(e) = self.task.await {
            warn!("[Engine] Engine task failed: {}", e);
        }
    }
}
