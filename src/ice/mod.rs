//! ICE (Interactive Connectivity Establishment) configuration.
//!
//! Provides the built-in STUN/TURN configurations and validation of the
//! configuration the relay server pushes to its clients.

use lazy_static::lazy_static;
use serde_json::Value;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::error::PeerConfigError;

/// URL schemes accepted in server-provided ICE configs
const ALLOWED_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

/// ICE server configuration
#[derive(Clone, Debug, PartialEq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN-only server config
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server config with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// Whether any URL of this server offers relaying
    pub fn is_relay(&self) -> bool {
        self.urls.iter().any(|u| u.contains("turn:") || u.contains("turns:"))
    }

    /// Convert to webrtc-rs RTCIceServer
    fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Which candidates a connection may use
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Complete ICE configuration for new peer connections
#[derive(Clone, Debug, PartialEq)]
pub struct IceConfig {
    pub policy: IceTransportPolicy,
    pub servers: Vec<IceServerConfig>,
}

impl IceConfig {
    /// Build the webrtc-rs configuration
    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.servers.iter().map(|s| s.to_rtc_ice_server()).collect(),
            ice_transport_policy: match self.policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        DEFAULT_ICE_CONFIG.clone()
    }
}

lazy_static! {
    /// Direct connections through a public STUN server
    pub static ref DEFAULT_ICE_CONFIG: IceConfig = IceConfig {
        policy: IceTransportPolicy::All,
        servers: google_stun_servers(),
    };

    /// Relay-only configuration used when the user forces relayed connections
    pub static ref FORCED_RELAY_ICE_CONFIG: IceConfig = IceConfig {
        policy: IceTransportPolicy::Relay,
        servers: vec![IceServerConfig::turn(
            "turn:turn.bettercrewl.ink:3478",
            "M9DRVaByiujoXeuYAAAG",
            "TpHR9HQNZ8taxjb3",
        )],
    };
}

/// Default Google STUN server
pub fn google_stun_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]
}

fn parse_urls(value: &Value, path: &str, errors: &mut Vec<String>) -> Vec<String> {
    let urls: Vec<String> = match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => {
            let mut urls = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(s) => urls.push(s.to_string()),
                    None => errors.push(format!("{}[{}] should be string", path, i)),
                }
            }
            if items.is_empty() {
                errors.push(format!("{} should NOT have fewer than 1 items", path));
            }
            urls
        }
        _ => {
            errors.push(format!("{} should be string or array of strings", path));
            return Vec::new();
        }
    };

    for url in &urls {
        if !ALLOWED_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            errors.push(format!("{} has unsupported url '{}'", path, url));
        }
    }
    urls
}

fn parse_optional_string(
    server: &serde_json::Map<String, Value>,
    key: &str,
    path: &str,
    errors: &mut Vec<String>,
) -> Option<String> {
    match server.get(key) {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(format!("{}.{} should be string", path, key));
            None
        }
    }
}

fn parse_ice_server(value: &Value, path: &str, errors: &mut Vec<String>) -> Option<IceServerConfig> {
    let Some(server) = value.as_object() else {
        errors.push(format!("{} should be object", path));
        return None;
    };

    for key in server.keys() {
        if !matches!(key.as_str(), "urls" | "username" | "credential") {
            errors.push(format!("{} should NOT have additional property '{}'", path, key));
        }
    }

    let urls = match server.get("urls") {
        Some(v) => parse_urls(v, &format!("{}.urls", path), errors),
        None => {
            errors.push(format!("{} should have required property 'urls'", path));
            Vec::new()
        }
    };

    Some(IceServerConfig {
        urls,
        username: parse_optional_string(server, "username", path, errors),
        credential: parse_optional_string(server, "credential", path, errors),
    })
}

/// Validate the `clientPeerConfig` the relay server sends.
///
/// Any schema violation rejects the whole config, as does a relay-only
/// config that names no TURN server; callers fall back to the default.
pub fn validate_client_peer_config(value: &Value) -> Result<IceConfig, PeerConfigError> {
    let mut errors = Vec::new();

    let Some(config) = value.as_object() else {
        return Err(PeerConfigError::Malformed(vec![" should be object".to_string()]));
    };

    for key in config.keys() {
        if !matches!(key.as_str(), "forceRelayOnly" | "iceServers") {
            errors.push(format!(" should NOT have additional property '{}'", key));
        }
    }

    let force_relay_only = match config.get("forceRelayOnly") {
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            errors.push(".forceRelayOnly should be boolean".to_string());
            false
        }
        None => {
            errors.push(" should have required property 'forceRelayOnly'".to_string());
            false
        }
    };

    let servers = match config.get("iceServers") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| parse_ice_server(item, &format!(".iceServers[{}]", i), &mut errors))
            .collect(),
        Some(_) => {
            errors.push(".iceServers should be array".to_string());
            Vec::new()
        }
        None => {
            errors.push(" should have required property 'iceServers'".to_string());
            Vec::new()
        }
    };

    if !errors.is_empty() {
        return Err(PeerConfigError::Malformed(errors));
    }

    if force_relay_only && !servers.iter().any(IceServerConfig::is_relay) {
        return Err(PeerConfigError::RelayOnlyWithoutRelay);
    }

    Ok(IceConfig {
        policy: if force_relay_only {
            IceTransportPolicy::Relay
        } else {
            IceTransportPolicy::All
        },
        servers,
    })
}
