//! Peer state module
//!
//! Peer entries, connection states and the per-peer flags reported in
//! snapshots.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Lifecycle of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    /// TCP connect in progress
    #[default]
    Connecting,
    HandshakeSent,
    HandshakeReceived,
    /// Exchanging messages
    Running,
    Closing,
}

impl ConnState {
    pub fn is_running(&self) -> bool {
        matches!(self, ConnState::Running)
    }

    /// States only move forward; any state may close
    pub fn can_advance_to(self, next: ConnState) -> bool {
        next == ConnState::Closing || next as u8 > self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::HandshakeSent,
            2 => ConnState::HandshakeReceived,
            3 => ConnState::Running,
            _ => ConnState::Closing,
        }
    }
}

/// Connection state shared by a connection task and its handle
#[derive(Debug, Clone, Default)]
pub struct SharedConnState(Arc<AtomicU8>);

impl SharedConnState {
    pub fn get(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `next`; false when that would go backwards
    pub fn advance(&self, next: ConnState) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                ConnState::from_u8(current).can_advance_to(next).then_some(next as u8)
            })
            .is_ok()
    }
}

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Manual,
    Incoming,
}

/// Flags recorded for a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFlags {
    pub encrypted: bool,
    pub seed: bool,
    pub local: bool,
    pub supports_extension_protocol: bool,
    pub snubbed: bool,
}

/// A known peer, connected or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub flags: PeerFlags,
    pub source: PeerSource,
}

impl PeerEntry {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            peer_id: None,
            flags: PeerFlags::default(),
            source,
        }
    }

    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}

/// The four choke/interest booleans of a running connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChokeState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl ChokeState {
    /// We may send requests to this peer
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested
    }
}

/// One row of the peer list in a state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: Option<String>,
    pub state: ConnState,
    pub ip: String,
    pub port: u16,
    pub flags: PeerFlags,
    pub choke: ChokeState,
    pub up_rate: f64,
    pub down_rate: f64,
    pub have_fraction: f64,
    pub client_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let choke = ChokeState::default();
        assert!(choke.am_choking && choke.peer_choking);
        assert!(!choke.can_request());
        assert_eq!(ConnState::default(), ConnState::Connecting);
    }

    #[test]
    fn test_shared_state_moves_forward() {
        let state = SharedConnState::default();
        assert_eq!(state.get(), ConnState::Connecting);
        assert!(state.advance(ConnState::HandshakeReceived));
        assert!(!state.advance(ConnState::HandshakeSent));
        assert!(state.advance(ConnState::Running));
        assert!(state.get().is_running());
        assert!(state.advance(ConnState::Closing));
        assert!(!state.advance(ConnState::Running));
        assert!(state.advance(ConnState::Closing));
        assert_eq!(state.get(), ConnState::Closing);
    }

    #[test]
    fn test_can_request() {
        let mut choke = ChokeState::default();
        choke.peer_choking = false;
        assert!(!choke.can_request());
        choke.am_interested = true;
        assert!(choke.can_request());
    }

    #[test]
    fn test_entry() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut entry = PeerEntry::new(addr, PeerSource::Manual);
        assert!(entry.peer_id_hex().is_none());
        entry.peer_id = Some([0xab; 20]);
        assert_eq!(entry.peer_id_hex().unwrap().len(), 40);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"manual\""));
    }
}
