//! Peer management module
//!
//! Peer connections, the candidate pool and the choker.

pub mod choker;
pub mod connection;
pub mod manager;
pub mod state;

pub use choker::{ChokeCandidate, Choker, SuperSeeder};
pub use connection::{extension_handshake, initial_announcement, ConnectionConfig, PeerCommand, PeerConnection, PeerEvent, PeerEventSender};
pub use manager::{PeerPool, PoolLimits};
pub use state::{ChokeState, ConnState, PeerEntry, PeerFlags, PeerSnapshot, PeerSource, SharedConnState};
