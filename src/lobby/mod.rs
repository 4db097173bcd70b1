//! Lobby rule settings and their host-to-peer replication.

pub mod settings;
pub mod sync;

pub use settings::*;
pub use sync::*;
