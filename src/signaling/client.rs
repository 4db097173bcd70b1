//! WebSocket connection to the relay server.
//!
//! Flow:
//! 1. Validate the server URL and map http(s) to ws(s)
//! 2. Connect and split the socket into a writer task and a reader task
//! 3. Outgoing [`ClientMessage`]s are queued to the writer task
//! 4. Incoming frames are parsed and handed to the event callback
//!
//! The client owns the transport only. Dropping the connection never touches
//! peer sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::messages::{ClientMessage, ServerMessage, SignalPayload};
use super::{RelaySink, SignalingCallback, SignalingEvent};
use crate::error::SignalingError;
use crate::ice::{validate_client_peer_config, IceConfig};

/// Map a user supplied relay URL onto a WebSocket URL
pub fn relay_url(server_url: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };

    let mut url = Url::parse(server_url.trim()).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot use scheme '{}'", scheme)))?;
    }
    Ok(url)
}

/// Live connection to the relay server
pub struct SignalingClient {
    url: Url,
    ws_sender: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    on_event: SignalingCallback,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to the relay and start relaying its events to `on_event`
    pub async fn connect(server_url: &str, on_event: SignalingCallback) -> Result<Self, SignalingError> {
        let url = relay_url(server_url)?;

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;

        info!("[Signaling] Connected to relay server: {}", url);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let connected = Arc::new(AtomicBool::new(true));
        on_event(SignalingEvent::Connected);

        let reader_connected = connected.clone();
        let reader_events = on_event.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch(&text, &reader_events),
                    Ok(Message::Close(_)) => {
                        info!("[Signaling] Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[Signaling] WebSocket error: {}", e);
                        break;
                    }
                }
            }
            if reader_connected.swap(false, Ordering::SeqCst) {
                reader_events(SignalingEvent::Disconnected);
            }
        });

        Ok(Self {
            url,
            ws_sender: tx,
            connected,
            on_event,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the transport. Emits `Disconnected` once.
    pub fn disconnect(&self) {
        let _ = self.ws_sender.send(Message::Close(None));
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("[Signaling] Disconnected from {}", self.url);
            (self.on_event)(SignalingEvent::Disconnected);
        }
    }
}

impl RelaySink for SignalingClient {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        let json = msg.to_json()?;
        debug!("[Signaling] -> {}", msg.event());
        self.ws_sender
            .send(Message::Text(json))
            .map_err(|_| SignalingError::Closed)?;

        if let ClientMessage::Join { lobby_code, .. } = msg {
            (self.on_event)(SignalingEvent::Joined { lobby_code });
        }
        Ok(())
    }

    fn close(&self) {
        self.disconnect();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Parse one relay frame and forward it as a [`SignalingEvent`]
fn dispatch(text: &str, on_event: &SignalingCallback) {
    let msg = match ServerMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("[Signaling] Dropping frame: {}", e);
            return;
        }
    };

    match msg {
        ServerMessage::Join { peer, client } => {
            on_event(SignalingEvent::PeerJoined { peer, client });
        }
        ServerMessage::Signal { from, data } => match serde_json::from_value::<SignalPayload>(data) {
            Ok(data) => on_event(SignalingEvent::Signal { from, data }),
            Err(e) => warn!("[Signaling] Unrecognized signal payload from {}: {}", from, e),
        },
        ServerMessage::SetClient { peer, client } => {
            on_event(SignalingEvent::ClientUpdated { peer, client });
        }
        ServerMessage::SetClients(clients) => {
            on_event(SignalingEvent::ClientDirectory(clients));
        }
        ServerMessage::ClientPeerConfig(value) => match validate_client_peer_config(&value) {
            Ok(config) => on_event(SignalingEvent::PeerConfig(config)),
            Err(e) => {
                warn!("[Signaling] {}", e);
                on_event(SignalingEvent::Warning(e.to_string()));
                on_event(SignalingEvent::PeerConfig(IceConfig::default()));
            }
        },
        ServerMessage::Error(message) => {
            warn!("[Signaling] Relay error: {}", message);
            on_event(SignalingEvent::Error(message));
        }
    }
}
