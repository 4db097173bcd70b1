//! Owns every live peer session of the current lobby.
//!
//! The manager is the only writer of the session map and the client
//! directory. Connection backends report through [`PeerEvent`]s which the
//! engine feeds back into [`PeerSessionManager::handle_event`]; events whose
//! session token no longer matches a live session are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::connection::{
    ConnectionState, LinkRequest, PeerConnector, PeerEvent, PeerEventCallback, PeerEventKind, PeerLink,
    SessionToken,
};
use super::PeerId;
use crate::audio::MediaStream;
use crate::config::SETTINGS_PUSH_DELAY;
use crate::error::PeerError;
use crate::game::MENU_LOBBY_CODE;
use crate::ice::{IceConfig, FORCED_RELAY_ICE_CONFIG};
use crate::signaling::{Client, ClientMessage, RelaySink, SignalPayload};

/// One connection to a remote participant
struct PeerSession {
    link: Box<dyn PeerLink>,
    token: SessionToken,
    initiator: bool,
    state: ConnectionState,
    ice_restarted: bool,
    audio_connected: bool,
    settings_push: Option<JoinHandle<()>>,
}

impl PeerSession {
    /// Stop everything scoped to this session
    fn close(mut self) {
        if let Some(push) = self.settings_push.take() {
            push.abort();
        }
        self.link.close();
    }
}

/// Result of [`PeerSessionManager::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Same lobby as before
    Unchanged,
    /// Back at the menu; every session was closed
    Reset { closed: Vec<PeerId> },
    /// Join sent for a new lobby
    Joined { closed: Vec<PeerId>, as_guest: bool },
}

/// What the engine has to act on after a connection event
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// Nothing outside the manager changed
    None,
    Connected(PeerId),
    /// Build the audio graph for this stream
    StreamReady(PeerId, Arc<MediaStream>),
    /// Data channel message with the sender's client id, if known
    Data {
        peer: PeerId,
        client_id: Option<u32>,
        data: Vec<u8>,
    },
    /// Push the host's settings to this peer now
    SettingsPushDue(PeerId),
    /// Session is gone; release its audio graph
    Closed(PeerId),
}

/// Peer mesh for one voice session
pub struct PeerSessionManager {
    connector: Box<dyn PeerConnector>,
    relay: Arc<dyn RelaySink>,
    events: PeerEventCallback,
    sessions: HashMap<PeerId, PeerSession>,
    clients: HashMap<PeerId, Client>,
    ice_config: IceConfig,
    force_relay: bool,
    current_lobby: String,
    is_host: bool,
    next_token: u64,
}

impl PeerSessionManager {
    pub fn new(connector: Box<dyn PeerConnector>, relay: Arc<dyn RelaySink>, events: PeerEventCallback) -> Self {
        Self {
            connector,
            relay,
            events,
            sessions: HashMap::new(),
            clients: HashMap::new(),
            ice_config: IceConfig::default(),
            force_relay: false,
            current_lobby: String::new(),
            is_host: false,
            next_token: 0,
        }
    }

    /// Lobby the last join was sent for, "MENU" or empty before any
    pub fn current_lobby(&self) -> &str {
        &self.current_lobby
    }

    pub fn set_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    /// ICE configuration provided by the relay, used for new connections
    pub fn set_ice_config(&mut self, config: IceConfig) {
        self.ice_config = config;
    }

    /// Force the built-in relay for new connections
    pub fn set_force_relay(&mut self, force: bool) {
        self.force_relay = force;
    }

    /// Configuration new connections are opened with
    pub fn effective_ice_config(&self) -> IceConfig {
        if self.force_relay {
            FORCED_RELAY_ICE_CONFIG.clone()
        } else {
            self.ice_config.clone()
        }
    }

    pub fn attach_microphone(&mut self, stream: Arc<MediaStream>) {
        self.connector.attach_microphone(stream);
    }

    pub fn relay(&self) -> &Arc<dyn RelaySink> {
        &self.relay
    }

    /// Enter a lobby, or the menu.
    ///
    /// The same code twice is a no-op. "MENU" closes every session and
    /// clears the client directory.
    pub fn connect(&mut self, lobby_code: &str, player_id: i32, client_id: u32, is_host: bool) -> ConnectOutcome {
        self.is_host = is_host;

        if lobby_code == MENU_LOBBY_CODE {
            let closed = self.disconnect_all();
            self.clients.clear();
            self.current_lobby = lobby_code.to_string();
            info!("[PeerSession] Back at menu, closed {} session(s)", closed.len());
            return ConnectOutcome::Reset { closed };
        }

        if self.current_lobby == lobby_code {
            debug!("[PeerSession] Already joined {}", lobby_code);
            return ConnectOutcome::Unchanged;
        }

        let closed = self.disconnect_all();
        if let Err(e) = self.relay.send(ClientMessage::Join {
            lobby_code: lobby_code.to_string(),
            player_id,
            client_id,
        }) {
            warn!("[PeerSession] Failed to send join for {}: {}", lobby_code, e);
        }
        self.current_lobby = lobby_code.to_string();
        info!("[PeerSession] Joining lobby {} as {}", lobby_code, if is_host { "host" } else { "guest" });

        ConnectOutcome::Joined {
            closed,
            as_guest: !is_host,
        }
    }

    /// Leave the lobby on the relay and close every session
    pub fn leave(&mut self) -> Vec<PeerId> {
        if let Err(e) = self.relay.send(ClientMessage::Leave) {
            warn!("[PeerSession] Failed to send leave: {}", e);
        }
        self.disconnect_all()
    }

    fn open_session(&mut self, peer: &PeerId, initiator: bool) -> Result<(), PeerError> {
        if let Some(old) = self.sessions.remove(peer) {
            warn!("[PeerSession] Replacing existing session with {}", peer);
            old.close();
        }

        self.next_token += 1;
        let token = SessionToken(self.next_token);
        let link = self.connector.open(LinkRequest {
            peer: peer.clone(),
            session: token,
            initiator,
            ice: self.effective_ice_config(),
            events: self.events.clone(),
        })?;

        self.sessions.insert(
            peer.clone(),
            PeerSession {
                link,
                token,
                initiator,
                state: ConnectionState::Negotiating,
                ice_restarted: false,
                audio_connected: false,
                settings_push: None,
            },
        );
        Ok(())
    }

    /// The relay announced a peer that joined after us; we make the offer
    pub fn peer_joined(&mut self, peer: PeerId, client: Client) -> Result<(), PeerError> {
        self.clients.insert(peer.clone(), client);
        self.open_session(&peer, true)
    }

    /// Negotiation payload from a peer; opens an answering session if needed
    pub fn signal(&mut self, from: PeerId, payload: SignalPayload) -> Result<(), PeerError> {
        if !self.sessions.contains_key(&from) {
            self.open_session(&from, false)?;
        }
        if let Some(session) = self.sessions.get(&from) {
            session.link.signal(payload);
        }
        Ok(())
    }

    pub fn set_client(&mut self, peer: PeerId, client: Client) {
        self.clients.insert(peer, client);
    }

    pub fn set_clients(&mut self, clients: HashMap<PeerId, Client>) {
        self.clients = clients;
    }

    /// Peer id to client directory
    pub fn clients(&self) -> &HashMap<PeerId, Client> {
        &self.clients
    }

    pub fn client_of(&self, peer: &PeerId) -> Option<Client> {
        self.clients.get(peer).copied()
    }

    /// Client id to peer id, as the tick loop looks peers up
    pub fn player_socket_ids(&self) -> HashMap<u32, PeerId> {
        self.clients
            .iter()
            .map(|(peer, client)| (client.client_id, peer.clone()))
            .collect()
    }

    pub fn peer_for_client(&self, client_id: u32) -> Option<&PeerId> {
        self.clients
            .iter()
            .find(|(_, c)| c.client_id == client_id)
            .map(|(peer, _)| peer)
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        self.sessions
            .get(peer)
            .map_or(ConnectionState::Closed, |s| s.state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.sessions.keys()
    }

    /// Peers whose audio stream has arrived
    pub fn audio_connected(&self) -> HashMap<PeerId, bool> {
        self.sessions
            .iter()
            .map(|(peer, s)| (peer.clone(), s.audio_connected))
            .collect()
    }

    /// Send a text message to one peer's data channel
    pub fn send_data(&self, peer: &PeerId, payload: &str) -> Result<(), PeerError> {
        self.sessions
            .get(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.clone()))?
            .link
            .send(payload)
    }

    /// Send to every connected peer; returns the failures
    pub fn broadcast(&self, payload: &str) -> Vec<(PeerId, PeerError)> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state == ConnectionState::Connected)
            .filter_map(|(peer, s)| s.link.send(payload).err().map(|e| (peer.clone(), e)))
            .collect()
    }

    /// Close one session. Returns false if there was none.
    pub fn disconnect_peer(&mut self, peer: &PeerId) -> bool {
        match self.sessions.remove(peer) {
            Some(session) => {
                session.close();
                info!("[PeerSession] Closed session with {}", peer);
                true
            }
            None => false,
        }
    }

    /// Close every session; returns the peers that had one
    pub fn disconnect_all(&mut self) -> Vec<PeerId> {
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in &peers {
            self.disconnect_peer(peer);
        }
        peers
    }

    fn schedule_settings_push(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if let Some(old) = session.settings_push.take() {
            old.abort();
        }

        let events = self.events.clone();
        let event = PeerEvent {
            peer: peer.clone(),
            session: session.token,
            kind: PeerEventKind::SettingsPushDue,
        };
        session.settings_push = Some(tokio::spawn(async move {
            tokio::time::sleep(SETTINGS_PUSH_DELAY).await;
            events(event);
        }));
    }

    /// Apply a connection event
    pub fn handle_event(&mut self, event: PeerEvent) -> SessionUpdate {
        let PeerEvent { peer, session, kind } = event;

        let Some(current) = self.sessions.get_mut(&peer) else {
            debug!("[PeerSession] Ignoring {:?} for closed session with {}", kind, peer);
            return SessionUpdate::None;
        };
        if current.token != session {
            debug!("[PeerSession] Ignoring stale event from {} ({:?})", peer, session);
            return SessionUpdate::None;
        }

        match kind {
            PeerEventKind::Signal(payload) => {
                let data = match serde_json::to_value(&payload) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("[PeerSession] Failed to encode signal for {}: {}", peer, e);
                        return SessionUpdate::None;
                    }
                };
                if let Err(e) = self.relay.send(ClientMessage::Signal {
                    to: peer.to_string(),
                    data,
                }) {
                    warn!("[PeerSession] Failed to relay signal to {}: {}", peer, e);
                }
                SessionUpdate::None
            }
            PeerEventKind::Connected => {
                current.state = ConnectionState::Connected;
                info!("[PeerSession] Connected to {}", peer);
                if self.is_host {
                    self.schedule_settings_push(&peer);
                }
                SessionUpdate::Connected(peer)
            }
            PeerEventKind::Stream(stream) => {
                current.audio_connected = true;
                info!("[PeerSession] Audio stream from {}", peer);
                SessionUpdate::StreamReady(peer, stream)
            }
            PeerEventKind::Data(data) => {
                let client_id = self.clients.get(&peer).map(|c| c.client_id);
                SessionUpdate::Data { peer, client_id, data }
            }
            PeerEventKind::SettingsPushDue => {
                current.settings_push = None;
                SessionUpdate::SettingsPushDue(peer)
            }
            PeerEventKind::IceFailed => {
                if current.initiator && !current.ice_restarted {
                    current.ice_restarted = true;
                    current.link.restart_ice();
                    SessionUpdate::None
                } else {
                    warn!("[PeerSession] ICE failed with {}", peer);
                    self.disconnect_peer(&peer);
                    SessionUpdate::Closed(peer)
                }
            }
            PeerEventKind::Error(message) => {
                warn!("[PeerSession] Error on connection to {}: {}", peer, message);
                SessionUpdate::None
            }
            PeerEventKind::Closed => {
                info!("[PeerSession] {} closed the connection", peer);
                self.disconnect_peer(&peer);
                SessionUpdate::Closed(peer)
            }
        }
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalingError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl RelaySink for RecordingRelay {
        fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
            self.sent.lock().push(msg);
            Ok(())
        }
    }

    #[derive(Default)]
    struct LinkLog {
        opened: Vec<(PeerId, bool, IceConfig)>,
        signals: Vec<(PeerId, SignalPayload)>,
        restarts: Vec<PeerId>,
        closed: Vec<PeerId>,
    }

    struct FakeLink {
        peer: PeerId,
        log: Arc<Mutex<LinkLog>>,
    }

    impl PeerLink for FakeLink {
        fn signal(&self, payload: SignalPayload) {
            self.log.lock().signals.push((self.peer.clone(), payload));
        }

        fn send(&self, _data: &str) -> Result<(), PeerError> {
            Ok(())
        }

        fn restart_ice(&self) {
            self.log.lock().restarts.push(self.peer.clone());
        }

        fn close(&self) {
            self.log.lock().closed.push(self.peer.clone());
        }
    }

    struct FakeConnector {
        log: Arc<Mutex<LinkLog>>,
    }

    impl PeerConnector for FakeConnector {
        fn open(&self, request: LinkRequest) -> Result<Box<dyn PeerLink>, PeerError> {
            self.log
                .lock()
                .opened
                .push((request.peer.clone(), request.initiator, request.ice.clone()));
            Ok(Box::new(FakeLink {
                peer: request.peer,
                log: self.log.clone(),
            }))
        }
    }

    fn manager() -> (PeerSessionManager, Arc<RecordingRelay>, Arc<Mutex<LinkLog>>) {
        let relay = Arc::new(RecordingRelay::default());
        let log = Arc::new(Mutex::new(LinkLog::default()));
        let events: PeerEventCallback = Arc::new(|_| {});
        let mgr = PeerSessionManager::new(Box::new(FakeConnector { log: log.clone() }), relay.clone(), events);
        (mgr, relay, log)
    }

    fn client(id: u32) -> Client {
        Client {
            player_id: id as i32,
            client_id: id,
        }
    }

    fn event(peer: &str, session: u64, kind: PeerEventKind) -> PeerEvent {
        PeerEvent {
            peer: PeerId::from(peer),
            session: SessionToken(session),
            kind,
        }
    }

    #[test]
    fn test_connect_is_idempotent_per_code() {
        let (mut mgr, relay, _) = manager();
        assert!(matches!(
            mgr.connect("ABCDEF", 1, 10, false),
            ConnectOutcome::Joined { as_guest: true, .. }
        ));
        assert_eq!(mgr.connect("ABCDEF", 1, 10, false), ConnectOutcome::Unchanged);
        assert_eq!(relay.sent.lock().len(), 1);
        assert_eq!(mgr.current_lobby(), "ABCDEF");
    }

    #[test]
    fn test_menu_resets_everything() {
        let (mut mgr, _relay, log) = manager();
        mgr.connect("ABCDEF", 1, 10, true);
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        mgr.signal(PeerId::from("b"), SignalPayload::Offer { sdp: "x".into() }).unwrap();

        let ConnectOutcome::Reset { mut closed } = mgr.connect(MENU_LOBBY_CODE, 0, 10, true) else {
            panic!("expected reset");
        };
        closed.sort();
        assert_eq!(closed, vec![PeerId::from("a"), PeerId::from("b")]);
        assert_eq!(mgr.session_count(), 0);
        assert!(mgr.clients().is_empty());
        assert_eq!(log.lock().closed.len(), 2);
    }

    #[test]
    fn test_initiator_and_answerer_roles() {
        let (mut mgr, _relay, log) = manager();
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        mgr.signal(PeerId::from("b"), SignalPayload::Offer { sdp: "x".into() }).unwrap();
        mgr.signal(PeerId::from("b"), SignalPayload::Answer { sdp: "y".into() }).unwrap();

        let log = log.lock();
        assert_eq!(log.opened.len(), 2);
        assert!(log.opened[0].1);
        assert!(!log.opened[1].1);
        assert_eq!(log.signals.len(), 2);
        assert_eq!(mgr.state(&PeerId::from("b")), ConnectionState::Negotiating);
    }

    #[test]
    fn test_forced_relay_overrides_server_config() {
        let (mut mgr, _relay, log) = manager();
        mgr.set_force_relay(true);
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        assert_eq!(log.lock().opened[0].2, *FORCED_RELAY_ICE_CONFIG);
    }

    #[test]
    fn test_local_signal_is_relayed() {
        let (mut mgr, relay, _) = manager();
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        mgr.handle_event(event("a", 1, PeerEventKind::Signal(SignalPayload::Offer { sdp: "v=0".into() })));

        let sent = relay.sent.lock();
        let ClientMessage::Signal { to, data } = &sent[0] else {
            panic!("expected signal");
        };
        assert_eq!(to, "a");
        assert_eq!(data["type"], "offer");
    }

    #[test]
    fn test_stale_events_are_ignored() {
        let (mut mgr, _relay, _) = manager();
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        mgr.disconnect_peer(&PeerId::from("a"));
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();

        assert!(matches!(mgr.handle_event(event("a", 1, PeerEventKind::Closed)), SessionUpdate::None));
        assert_eq!(mgr.session_count(), 1);
        assert!(matches!(
            mgr.handle_event(event("a", 2, PeerEventKind::Closed)),
            SessionUpdate::Closed(_)
        ));
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut mgr, _relay, log) = manager();
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        assert!(mgr.disconnect_peer(&PeerId::from("a")));
        assert!(!mgr.disconnect_peer(&PeerId::from("a")));
        assert_eq!(log.lock().closed.len(), 1);
    }

    #[test]
    fn test_ice_failure_restarts_once() {
        let (mut mgr, _relay, log) = manager();
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        assert!(matches!(mgr.handle_event(event("a", 1, PeerEventKind::IceFailed)), SessionUpdate::None));
        assert_eq!(log.lock().restarts.len(), 1);
        assert!(matches!(
            mgr.handle_event(event("a", 1, PeerEventKind::IceFailed)),
            SessionUpdate::Closed(_)
        ));
    }

    #[test]
    fn test_data_carries_sender_client() {
        let (mut mgr, _relay, _) = manager();
        mgr.peer_joined(PeerId::from("a"), client(7)).unwrap();
        let SessionUpdate::Data { client_id, .. } = mgr.handle_event(event("a", 1, PeerEventKind::Data(b"{}".to_vec())))
        else {
            panic!("expected data");
        };
        assert_eq!(client_id, Some(7));
    }

    #[test]
    fn test_client_directory_inverts() {
        let (mut mgr, _relay, _) = manager();
        mgr.set_clients(HashMap::from([(PeerId::from("a"), client(1)), (PeerId::from("b"), client(2))]));
        mgr.set_client(PeerId::from("c"), client(3));
        let ids = mgr.player_socket_ids();
        assert_eq!(ids[&2], PeerId::from("b"));
        assert_eq!(mgr.peer_for_client(3), Some(&PeerId::from("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_push_fires_after_delay() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let events: PeerEventCallback = Arc::new(move |ev: PeerEvent| sink.lock().push(ev));
        let log = Arc::new(Mutex::new(LinkLog::default()));
        let mut mgr = PeerSessionManager::new(
            Box::new(FakeConnector { log }),
            Arc::new(RecordingRelay::default()),
            events,
        );
        mgr.connect("ABCDEF", 1, 10, true);
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        mgr.handle_event(event("a", 1, PeerEventKind::Connected));

        tokio::time::sleep(SETTINGS_PUSH_DELAY / 2).await;
        assert!(fired.lock().is_empty());
        tokio::time::sleep(SETTINGS_PUSH_DELAY).await;

        let ev = fired.lock().pop().unwrap();
        assert!(matches!(ev.kind, PeerEventKind::SettingsPushDue));
        assert!(matches!(mgr.handle_event(ev), SessionUpdate::SettingsPushDue(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_settings_push() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let events: PeerEventCallback = Arc::new(move |ev: PeerEvent| sink.lock().push(ev));
        let log = Arc::new(Mutex::new(LinkLog::default()));
        let mut mgr = PeerSessionManager::new(
            Box::new(FakeConnector { log }),
            Arc::new(RecordingRelay::default()),
            events,
        );
        mgr.connect("ABCDEF", 1, 10, true);
        mgr.peer_joined(PeerId::from("a"), client(2)).unwrap();
        mgr.handle_event(event("a", 1, PeerEventKind::Connected));
        mgr.leave();

        tokio::time::sleep(SETTINGS_PUSH_DELAY * 2).await;
        assert!(fired.lock().is_empty());
    }
}
