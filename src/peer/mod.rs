//! Peer connection management.
//!
//! One voice connection per remote participant, keyed by the relay-assigned
//! peer id.

pub mod connection;
pub mod manager;
pub mod rtc;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use connection::*;
pub use manager::*;
pub use rtc::RtcConnector;

/// Relay-assigned socket id of a remote participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
