//! Relay wire messages.
//!
//! Every frame is a JSON text message `{"event": <name>, "args": [...]}`
//! carrying the event's positional arguments.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::PeerId;

/// Identity a relay client registers with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub player_id: i32,
    pub client_id: u32,
}

/// ICE candidate as exchanged in signal payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Session negotiation payload relayed between two peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// Trickled ICE candidate
    Candidate { candidate: CandidateInit },
}

/// Raw relay frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Messages sent to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join {
        lobby_code: String,
        player_id: i32,
        client_id: u32,
    },
    Leave,
    Id {
        player_id: i32,
        client_id: u32,
    },
    Signal {
        to: String,
        data: Value,
    },
}

impl ClientMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::Id { .. } => "id",
            ClientMessage::Signal { .. } => "signal",
        }
    }

    pub fn to_frame(&self) -> RelayFrame {
        let args = match self {
            ClientMessage::Join {
                lobby_code,
                player_id,
                client_id,
            } => vec![
                Value::from(lobby_code.as_str()),
                Value::from(*player_id),
                Value::from(*client_id),
            ],
            ClientMessage::Leave => Vec::new(),
            ClientMessage::Id {
                player_id,
                client_id,
            } => vec![Value::from(*player_id), Value::from(*client_id)],
            ClientMessage::Signal { to, data } => {
                vec![serde_json::json!({ "to": to, "data": data })]
            }
        };
        RelayFrame {
            event: self.event().to_string(),
            args,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_frame())
    }
}

/// Messages received from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A peer joined the lobby after us; we initiate
    Join { peer: PeerId, client: Client },
    /// Negotiation payload from a peer
    Signal { from: PeerId, data: Value },
    SetClient { peer: PeerId, client: Client },
    SetClients(HashMap<PeerId, Client>),
    /// Server-provided ICE configuration, not yet validated
    ClientPeerConfig(Value),
    Error(String),
}

/// Why a relay frame could not be understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Json(String),
    UnknownEvent(String),
    BadArgs { event: String, reason: String },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Json(e) => write!(f, "invalid frame: {}", e),
            FrameError::UnknownEvent(event) => write!(f, "unknown event '{}'", event),
            FrameError::BadArgs { event, reason } => {
                write!(f, "bad arguments for '{}': {}", event, reason)
            }
        }
    }
}

#[derive(Deserialize)]
struct SignalFrom {
    from: PeerId,
    data: Value,
}

#[derive(Deserialize)]
struct ErrorArg {
    #[serde(default)]
    message: Option<String>,
}

fn arg<T: serde::de::DeserializeOwned>(frame: &RelayFrame, index: usize) -> Result<T, FrameError> {
    let value = frame.args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| FrameError::BadArgs {
        event: frame.event.clone(),
        reason: format!("argument {}: {}", index, e),
    })
}

impl ServerMessage {
    pub fn from_frame(frame: &RelayFrame) -> Result<Self, FrameError> {
        match frame.event.as_str() {
            "join" => Ok(ServerMessage::Join {
                peer: arg(frame, 0)?,
                client: arg(frame, 1)?,
            }),
            "signal" => {
                let SignalFrom { from, data } = arg(frame, 0)?;
                Ok(ServerMessage::Signal { from, data })
            }
            "setClient" => Ok(ServerMessage::SetClient {
                peer: arg(frame, 0)?,
                client: arg(frame, 1)?,
            }),
            "setClients" => Ok(ServerMessage::SetClients(arg(frame, 0)?)),
            "clientPeerConfig" => Ok(ServerMessage::ClientPeerConfig(arg(frame, 0)?)),
            "error" => {
                let message = match frame.args.first() {
                    Some(Value::String(s)) => s.clone(),
                    _ => arg::<ErrorArg>(frame, 0)?.message.unwrap_or_default(),
                };
                Ok(ServerMessage::Error(message))
            }
            other => Err(FrameError::UnknownEvent(other.to_string())),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, FrameError> {
        let frame: RelayFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
        Self::from_frame(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_frame() {
        let msg = ClientMessage::Join {
            lobby_code: "ABCDEF".to_string(),
            player_id: 4,
            client_id: 1234,
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "join", "args": ["ABCDEF", 4, 1234]}));
    }

    #[test]
    fn test_leave_and_signal_frames() {
        let leave: Value = serde_json::from_str(&ClientMessage::Leave.to_json().unwrap()).unwrap();
        assert_eq!(leave, json!({"event": "leave", "args": []}));

        let signal = ClientMessage::Signal {
            to: "peer-1".to_string(),
            data: json!({"type": "answer", "sdp": "v=0"}),
        };
        let value: Value = serde_json::from_str(&signal.to_json().unwrap()).unwrap();
        assert_eq!(value["args"][0]["to"], "peer-1");
        assert_eq!(value["args"][0]["data"]["type"], "answer");
    }

    #[test]
    fn test_parse_server_messages() {
        let join = ServerMessage::from_json(
            r#"{"event":"join","args":["abc",{"playerId":2,"clientId":99}]}"#,
        )
        .unwrap();
        assert_eq!(
            join,
            ServerMessage::Join {
                peer: PeerId::from("abc"),
                client: Client { player_id: 2, client_id: 99 }
            }
        );

        let signal = ServerMessage::from_json(
            r#"{"event":"signal","args":[{"from":"abc","data":{"type":"offer","sdp":"x"}}]}"#,
        )
        .unwrap();
        assert!(matches!(signal, ServerMessage::Signal { ref from, .. } if from.as_str() == "abc"));

        let clients = ServerMessage::from_json(
            r#"{"event":"setClients","args":[{"a":{"playerId":1,"clientId":10},"b":{"playerId":2,"clientId":20}}]}"#,
        )
        .unwrap();
        let ServerMessage::SetClients(map) = clients else {
            panic!("expected setClients");
        };
        assert_eq!(map[&PeerId::from("b")].client_id, 20);
    }

    #[test]
    fn test_error_message_shapes() {
        let a = ServerMessage::from_json(r#"{"event":"error","args":[{"message":"boom"}]}"#).unwrap();
        let b = ServerMessage::from_json(r#"{"event":"error","args":["boom"]}"#).unwrap();
        assert_eq!(a, ServerMessage::Error("boom".to_string()));
        assert_eq!(a, b);
    }

    #[test]
    fn test_bad_frames() {
        assert!(matches!(ServerMessage::from_json("nope"), Err(FrameError::Json(_))));
        assert!(matches!(
            ServerMessage::from_json(r#"{"event":"wat"}"#),
            Err(FrameError::UnknownEvent(_))
        ));
        assert!(matches!(
            ServerMessage::from_json(r#"{"event":"join","args":[5]}"#),
            Err(FrameError::BadArgs { .. })
        ));
    }

    #[test]
    fn test_signal_payload_shapes() {
        let offer: SignalPayload = serde_json::from_value(json!({"type": "offer", "sdp": "v=0"})).unwrap();
        assert_eq!(offer, SignalPayload::Offer { sdp: "v=0".to_string() });

        let cand: SignalPayload = serde_json::from_value(json!({
            "type": "candidate",
            "candidate": {"candidate": "candidate:1 1 UDP 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        let SignalPayload::Candidate { candidate } = cand else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    }
}
