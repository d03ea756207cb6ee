//! Peer pool module
//!
//! Candidate peers for one download, connection admission and IP bans.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::state::{PeerEntry, PeerSource};

/// Protocol violations tolerated from one IP before it is banned
pub const VIOLATIONS_BEFORE_BAN: u32 = 3;

/// Connection limits applied by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_connections: usize,
    pub max_incoming: usize,
    pub max_outgoing_connects: usize,
    pub not_same_ip: bool,
}

/// Candidates and live connections of one download
#[derive(Debug)]
pub struct PeerPool {
    limits: PoolLimits,
    candidates: VecDeque<PeerEntry>,
    known: HashSet<SocketAddr>,
    connecting: HashSet<SocketAddr>,
    /// Live connections and whether they were accepted
    connected: HashMap<SocketAddr, bool>,
    excluded: HashSet<IpAddr>,
    violations: HashMap<IpAddr, u32>,
}

impl PeerPool {
    pub fn new(limits: PoolLimits, exclude_ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            limits,
            candidates: VecDeque::new(),
            known: HashSet::new(),
            connecting: HashSet::new(),
            connected: HashMap::new(),
            excluded: exclude_ips.into_iter().collect(),
            violations: HashMap::new(),
        }
    }

    pub fn set_limits(&mut self, limits: PoolLimits) {
        self.limits = limits;
    }

    /// Add a candidate; duplicates by (ip, port) and banned IPs are dropped
    pub fn add(&mut self, entry: PeerEntry) -> bool {
        if self.excluded.contains(&entry.addr.ip()) {
            trace!("Ignoring banned peer {}", entry.addr);
            return false;
        }
        if !self.known.insert(entry.addr) {
            return false;
        }
        // Manually added peers go first
        if entry.source == PeerSource::Manual {
            self.candidates.push_front(entry);
        } else {
            self.candidates.push_back(entry);
        }
        true
    }

    /// Add many addresses from one source; returns how many were new
    pub fn add_many(&mut self, addrs: impl IntoIterator<Item = SocketAddr>, source: PeerSource) -> usize {
        let added = addrs
            .into_iter()
            .filter(|addr| self.add(PeerEntry::new(*addr, source)))
            .count();
        if added > 0 {
            debug!("Added {} {:?} peers ({} candidates)", added, source, self.candidates.len());
        }
        added
    }

    /// Candidates to dial now, respecting every limit
    pub fn next_to_connect(&mut self) -> Vec<PeerEntry> {
        let total = self.connected.len() + self.connecting.len();
        let slots = self
            .limits
            .max_connections
            .saturating_sub(total)
            .min(self.limits.max_outgoing_connects.saturating_sub(self.connecting.len()));

        let mut picked = Vec::new();
        let mut deferred = Vec::new();
        while picked.len() < slots {
            let Some(entry) = self.candidates.pop_front() else {
                break;
            };
            if self.excluded.contains(&entry.addr.ip()) {
                continue;
            }
            if self.limits.not_same_ip && self.ip_in_use(entry.addr.ip()) {
                deferred.push(entry);
                continue;
            }
            self.connecting.insert(entry.addr);
            picked.push(entry);
        }
        for entry in deferred.into_iter().rev() {
            self.candidates.push_front(entry);
        }
        picked
    }

    fn ip_in_use(&self, ip: IpAddr) -> bool {
        self.connected.keys().chain(self.connecting.iter()).any(|a| a.ip() == ip)
    }

    /// Check an accepted connection against bans and limits
    pub fn admit_incoming(&self, addr: SocketAddr) -> Result<()> {
        if self.excluded.contains(&addr.ip()) {
            return Err(TorrentError::network_error_with_address("Peer IP is banned", addr.to_string()).into());
        }
        if self.connected.contains_key(&addr) {
            return Err(TorrentError::network_error_with_address("Already connected", addr.to_string()).into());
        }
        let incoming = self.connected.values().filter(|inc| **inc).count();
        if incoming >= self.limits.max_incoming || self.connected.len() >= self.limits.max_connections {
            return Err(TorrentError::network_error_with_address("Connection limit reached", addr.to_string()).into());
        }
        if self.limits.not_same_ip && self.ip_in_use(addr.ip()) {
            return Err(TorrentError::network_error_with_address(
                "Another connection from this IP exists",
                addr.to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn mark_connected(&mut self, addr: SocketAddr, incoming: bool) {
        self.connecting.remove(&addr);
        self.known.insert(addr);
        self.connected.insert(addr, incoming);
    }

    /// Forget a connection; `retry` puts the address back at the end of the queue
    pub fn mark_disconnected(&mut self, addr: SocketAddr, retry: bool) {
        self.connecting.remove(&addr);
        self.connected.remove(&addr);
        if retry && !self.excluded.contains(&addr.ip()) {
            self.candidates.push_back(PeerEntry::new(addr, PeerSource::Tracker));
        } else {
            self.known.remove(&addr);
        }
    }

    /// Count a protocol violation; returns true when the IP is now banned
    pub fn record_violation(&mut self, ip: IpAddr) -> bool {
        let count = self.violations.entry(ip).or_insert(0);
        *count += 1;
        if *count >= VIOLATIONS_BEFORE_BAN {
            self.ban(ip);
            return true;
        }
        false
    }

    pub fn ban(&mut self, ip: IpAddr) {
        if self.excluded.insert(ip) {
            warn!("Banning {}", ip);
            self.candidates.retain(|e| e.addr.ip() != ip);
        }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.excluded.contains(ip)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Drop everything but the bans
    pub fn clear(&mut self) {
        info!(
            "Clearing peer pool ({} candidates, {} connected)",
            self.candidates.len(),
            self.connected.len()
        );
        self.candidates.clear();
        self.known.clear();
        self.connecting.clear();
        self.connected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PoolLimits {
        PoolLimits {
            max_connections: 3,
            max_incoming: 1,
            max_outgoing_connects: 2,
            not_same_ip: false,
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_duplicates_coalesced() {
        let mut pool = PeerPool::new(limits(), []);
        assert_eq!(
            pool.add_many(
                vec![addr("10.0.0.1:1"), addr("10.0.0.1:1"), addr("10.0.0.1:2")],
                PeerSource::Tracker
            ),
            2
        );
        assert!(!pool.add(PeerEntry::new(addr("10.0.0.1:2"), PeerSource::Dht)));
        assert_eq!(pool.candidate_count(), 2);
    }

    #[test]
    fn test_connect_limits() {
        let mut pool = PeerPool::new(limits(), []);
        pool.add_many((1..=5).map(|i| addr(&format!("10.0.0.{}:1", i))), PeerSource::Tracker);
        let first = pool.next_to_connect();
        assert_eq!(first.len(), 2);
        assert!(pool.next_to_connect().is_empty());
        pool.mark_connected(first[0].addr, false);
        pool.mark_connected(first[1].addr, false);
        assert_eq!(pool.next_to_connect().len(), 1);
        assert!(pool.next_to_connect().is_empty());
    }

    #[test]
    fn test_manual_first() {
        let mut pool = PeerPool::new(limits(), []);
        pool.add(PeerEntry::new(addr("10.0.0.1:1"), PeerSource::Tracker));
        pool.add(PeerEntry::new(addr("127.0.0.1:9"), PeerSource::Manual));
        assert_eq!(pool.next_to_connect()[0].addr, addr("127.0.0.1:9"));
    }

    #[test]
    fn test_not_same_ip() {
        let mut l = limits();
        l.not_same_ip = true;
        let mut pool = PeerPool::new(l, []);
        pool.add_many(vec![addr("10.0.0.1:1"), addr("10.0.0.1:2")], PeerSource::Tracker);
        assert_eq!(pool.next_to_connect().len(), 1);
        assert_eq!(pool.candidate_count(), 1);
        assert!(pool.admit_incoming(addr("10.0.0.1:3")).is_err());
    }

    #[test]
    fn test_incoming_limit() {
        let mut pool = PeerPool::new(limits(), []);
        assert!(pool.admit_incoming(addr("10.0.0.9:1")).is_ok());
        pool.mark_connected(addr("10.0.0.9:1"), true);
        assert!(pool.admit_incoming(addr("10.0.0.8:1")).is_err());
    }

    #[test]
    fn test_ban_after_violations() {
        let mut pool = PeerPool::new(limits(), []);
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        pool.add(PeerEntry::new(addr("10.0.0.7:1"), PeerSource::Tracker));
        assert!(!pool.record_violation(ip));
        assert!(!pool.record_violation(ip));
        assert!(pool.record_violation(ip));
        assert!(pool.is_banned(&ip));
        assert_eq!(pool.candidate_count(), 0);
        assert!(!pool.add(PeerEntry::new(addr("10.0.0.7:2"), PeerSource::Pex)));
        assert!(pool.admit_incoming(addr("10.0.0.7:3")).is_err());
    }

    #[test]
    fn test_excluded_from_start() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let pool = PeerPool::new(limits(), [ip]);
        assert!(pool.is_banned(&ip));
    }
}
