//! Choking
//!
//! Reciprocal unchoke set re-evaluated every round, optimistic slots rotated
//! every third round, and the super-seeding piece allocator.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::picker::PeerKey;
use crate::protocol::Bitfield;

/// Rounds between optimistic-unchoke rotations
pub const OPTIMISTIC_ROUNDS: u32 = 3;

/// Per-peer input to a rechoke round
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChokeCandidate {
    pub peer: PeerKey,
    pub interested: bool,
    pub snubbed: bool,
    /// Rate the peer sends to us
    pub down_rate: f64,
    /// Rate we send to the peer
    pub up_rate: f64,
}

/// Reciprocal choker
#[derive(Debug)]
pub struct Choker {
    max_uploads: usize,
    min_uploads: usize,
    round: u32,
    optimistic: Vec<PeerKey>,
}

impl Choker {
    pub fn new(max_uploads: usize, min_uploads: usize) -> Self {
        Self {
            max_uploads,
            min_uploads,
            round: 0,
            optimistic: Vec::new(),
        }
    }

    pub fn set_limits(&mut self, max_uploads: usize, min_uploads: usize) {
        self.max_uploads = max_uploads;
        self.min_uploads = min_uploads;
    }

    /// Compute the set of peers to unchoke this round
    pub fn rechoke(&mut self, candidates: &[ChokeCandidate], seeding: bool) -> HashSet<PeerKey> {
        let mut ranked: Vec<&ChokeCandidate> = candidates.iter().filter(|c| c.interested && !c.snubbed).collect();
        // Leeching rewards peers that feed us; seeding favours fast receivers
        ranked.sort_by(|a, b| {
            let (ra, rb) = if seeding { (a.up_rate, b.up_rate) } else { (a.down_rate, b.down_rate) };
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });

        let regular: HashSet<PeerKey> = ranked.iter().take(self.max_uploads).map(|c| c.peer).collect();

        let rotate = self.round % OPTIMISTIC_ROUNDS == 0
            || self
                .optimistic
                .iter()
                .any(|p| !candidates.iter().any(|c| c.peer == *p && c.interested));
        if rotate {
            let mut pool: Vec<PeerKey> = candidates
                .iter()
                .filter(|c| c.interested && !regular.contains(&c.peer))
                .map(|c| c.peer)
                .collect();
            pool.shuffle(&mut rand::thread_rng());
            pool.truncate(self.min_uploads);
            trace!("Optimistic unchoke rotated to {:?}", pool);
            self.optimistic = pool;
        }
        self.optimistic.retain(|p| !regular.contains(p));
        self.round = self.round.wrapping_add(1);

        let unchoked: HashSet<PeerKey> = regular.into_iter().chain(self.optimistic.iter().copied()).collect();
        debug!(
            "Rechoke round {}: {} unchoked of {} candidates",
            self.round,
            unchoked.len(),
            candidates.len()
        );
        unchoked
    }
}

/// Hands each peer at most one piece at a time while super-seeding
#[derive(Debug, Default)]
pub struct SuperSeeder {
    /// Piece currently offered to each peer
    given: HashMap<PeerKey, u32>,
    /// How many peers each piece has been offered to
    offered: HashMap<u32, u32>,
}

impl SuperSeeder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Piece offered to a peer, if any
    pub fn offer_for(&self, peer: &PeerKey) -> Option<u32> {
        self.given.get(peer).copied()
    }

    /// Choose the least-offered piece the peer lacks; None while an offer is outstanding
    pub fn next_offer(&mut self, peer: PeerKey, peer_has: &Bitfield) -> Option<u32> {
        if self.given.contains_key(&peer) {
            return None;
        }
        let piece = (0..peer_has.len())
            .filter(|p| !peer_has.get(*p))
            .min_by_key(|p| (self.offered.get(p).copied().unwrap_or(0), *p))?;
        *self.offered.entry(piece).or_insert(0) += 1;
        self.given.insert(peer, piece);
        debug!("Super-seeding: offering piece {} to {}", piece, peer);
        Some(piece)
    }

    /// A peer announced HAVE; returns true when it completes its outstanding offer
    pub fn on_have(&mut self, peer: &PeerKey, piece: u32) -> bool {
        if self.given.get(peer) == Some(&piece) {
            self.given.remove(peer);
            return true;
        }
        false
    }

    pub fn remove_peer(&mut self, peer: &PeerKey) {
        if let Some(piece) = self.given.remove(peer) {
            if let Some(count) = self.offered.get_mut(&piece) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(n: u8) -> PeerKey {
        SocketAddr::from(([10, 0, 0, n], 1))
    }

    fn candidate(n: u8, down_rate: f64) -> ChokeCandidate {
        ChokeCandidate {
            peer: peer(n),
            interested: true,
            snubbed: false,
            down_rate,
            up_rate: 0.0,
        }
    }

    #[test]
    fn test_reciprocal_set() {
        let mut choker = Choker::new(2, 0);
        let cands = vec![candidate(1, 10.0), candidate(2, 30.0), candidate(3, 20.0)];
        let set = choker.rechoke(&cands, false);
        assert_eq!(set, [peer(2), peer(3)].into_iter().collect());
    }

    #[test]
    fn test_uninterested_and_snubbed_skipped() {
        let mut choker = Choker::new(4, 0);
        let mut a = candidate(1, 50.0);
        a.interested = false;
        let mut b = candidate(2, 40.0);
        b.snubbed = true;
        let set = choker.rechoke(&[a, b, candidate(3, 1.0)], false);
        assert_eq!(set, [peer(3)].into_iter().collect());
    }

    #[test]
    fn test_optimistic_rotates_every_three_rounds() {
        let mut choker = Choker::new(1, 1);
        let cands: Vec<_> = (1..=6).map(|n| candidate(n, n as f64)).collect();
        let first = choker.rechoke(&cands, false);
        assert_eq!(first.len(), 2);
        assert!(first.contains(&peer(6)));
        let opt = choker.optimistic.clone();
        choker.rechoke(&cands, false);
        choker.rechoke(&cands, false);
        assert_eq!(choker.optimistic, opt);
    }

    #[test]
    fn test_seeding_ranks_by_upload() {
        let mut choker = Choker::new(1, 0);
        let mut a = candidate(1, 100.0);
        a.up_rate = 1.0;
        let mut b = candidate(2, 0.0);
        b.up_rate = 5.0;
        assert_eq!(choker.rechoke(&[a, b], true), [peer(2)].into_iter().collect());
    }

    #[test]
    fn test_super_seeder() {
        let mut seeder = SuperSeeder::new();
        let empty = Bitfield::new(3);
        let a = seeder.next_offer(peer(1), &empty).unwrap();
        let b = seeder.next_offer(peer(2), &empty).unwrap();
        assert_ne!(a, b);
        assert_eq!(seeder.next_offer(peer(1), &empty), None);
        assert!(!seeder.on_have(&peer(1), b));
        assert!(seeder.on_have(&peer(1), a));
        let mut has_a = Bitfield::new(3);
        has_a.set(a, true);
        let next = seeder.next_offer(peer(1), &has_a).unwrap();
        assert_ne!(next, a);
        assert_eq!(seeder.offer_for(&peer(1)), Some(next));
    }
}
