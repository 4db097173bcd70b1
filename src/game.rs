//! Game-state snapshot types consumed from the external poller.
//!
//! Each tick delivers a complete [`GameState`]; nothing here is patched in
//! place. The engine keeps the previous phase itself to detect transitions.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Lobby code reported while the player is not in any lobby
pub const MENU_LOBBY_CODE: &str = "MENU";

/// Phase of the game as read from the client process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GamePhase {
    Lobby,
    Tasks,
    Discussion,
    #[default]
    Menu,
    Unknown,
}

impl GamePhase {
    /// TASKS or DISCUSSION
    pub fn is_in_game(self) -> bool {
        matches!(self, GamePhase::Tasks | GamePhase::Discussion)
    }
}

/// Security camera the local player may be viewing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CameraLocation {
    East,
    Central,
    Northeast,
    South,
    SouthWest,
    NorthWest,
    Skeld,
    #[default]
    #[serde(rename = "NONE")]
    None,
}

/// World position of a fixed camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPosition {
    pub x: f32,
    pub y: f32,
}

lazy_static! {
    /// Fixed camera positions on the only map with individually placed cameras.
    /// Skeld's camera view is a split screen and has no single position.
    static ref POLUS_CAMERAS: HashMap<CameraLocation, CameraPosition> = {
        let mut m = HashMap::new();
        m.insert(CameraLocation::East, CameraPosition { x: 29.0, y: -15.7 });
        m.insert(CameraLocation::Central, CameraPosition { x: 15.4, y: -15.4 });
        m.insert(CameraLocation::Northeast, CameraPosition { x: 24.4, y: -8.5 });
        m.insert(CameraLocation::South, CameraPosition { x: 17.0, y: -20.6 });
        m.insert(CameraLocation::SouthWest, CameraPosition { x: 4.7, y: -22.73 });
        m.insert(CameraLocation::NorthWest, CameraPosition { x: 11.6, y: -8.2 });
        m
    };
}

impl CameraLocation {
    /// Position used for the hear-through-cameras rule, if this camera has one
    pub fn position(self) -> Option<CameraPosition> {
        POLUS_CAMERAS.get(&self).copied()
    }
}

/// One player as seen in a single tick
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Player {
    /// In-game player id (small, reused between games)
    pub id: i32,
    /// Stable numeric identity of the player's client
    pub client_id: u32,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub is_dead: bool,
    pub is_impostor: bool,
    pub in_vent: bool,
    pub disconnected: bool,
    pub is_local: bool,
}

impl Player {
    pub fn is_alive(&self) -> bool {
        !self.is_dead
    }
}

/// Authoritative snapshot of the game for one tick
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameState {
    #[serde(rename = "gameState")]
    pub phase: GamePhase,
    pub lobby_code: String,
    /// Client id of the lobby host
    pub host_id: u32,
    pub is_host: bool,
    /// Client id of the local game client
    pub client_id: u32,
    pub current_camera: CameraLocation,
    pub coms_sabotaged: bool,
    pub players: Vec<Player>,
}

impl GameState {
    /// The local player, if the game reports one
    pub fn local_player(&self) -> Option<&Player> {
        self.players.iter().find(|p| p.is_local)
    }

    /// Every player that is not the local one
    pub fn other_players(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(|p| !p.is_local)
    }

    /// Lobby code, or the menu sentinel when none is reported
    pub fn lobby_code_or_menu(&self) -> &str {
        if self.lobby_code.is_empty() {
            MENU_LOBBY_CODE
        } else {
            &self.lobby_code
        }
    }
}
