//! Piece picker
//!
//! Chooses the next block to request from a given peer. Policies:
//! random-first until `rarest_first_cutoff` pieces are complete, rarest-first
//! afterwards (partial pieces win ties), endgame once every remaining block is
//! requested, and sequential order from a playback head for VOD.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::picker::priority::{AvailabilitySummary, PiecePriority};
use crate::protocol::Bitfield;
use crate::storage::{block_count, block_length, PieceState, BLOCK_SIZE};
use crate::torrent::TorrentInfo;

/// Peers are identified by their remote address
pub type PeerKey = SocketAddr;

/// A block to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Selection order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickMode {
    Normal,
    /// Ascending from `head` after any `Highest` pieces
    Sequential { head: u32 },
}

/// Result of feeding a received block to the picker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// First copy of this block; `cancels` lists duplicate requests to withdraw
    New {
        cancels: Vec<(PeerKey, BlockRequest)>,
        piece_complete: bool,
    },
    /// Block already received or piece already verified
    Duplicate,
    /// Offset or length does not describe a block of this torrent
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested(Vec<PeerKey>),
    Received,
}

#[derive(Debug, Clone)]
struct PieceRecord {
    length: u64,
    priority: PiecePriority,
    /// Empty until the piece is first requested
    blocks: Vec<BlockState>,
    verified: bool,
}

impl PieceRecord {
    fn block_total(&self) -> u32 {
        block_count(self.length)
    }

    fn started(&self) -> bool {
        self.blocks.iter().any(|b| *b != BlockState::Missing)
    }

    fn missing_blocks(&self) -> u32 {
        if self.blocks.is_empty() {
            return self.block_total();
        }
        self.blocks.iter().filter(|b| **b == BlockState::Missing).count() as u32
    }

    fn all_received(&self) -> bool {
        !self.blocks.is_empty() && self.blocks.iter().all(|b| *b == BlockState::Received)
    }

    fn ensure_blocks(&mut self) {
        if self.blocks.is_empty() {
            self.blocks = vec![BlockState::Missing; self.block_total() as usize];
        }
    }
}

/// Piece picker for one download
#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceRecord>,
    availability: Vec<u32>,
    have: Bitfield,
    peers: HashMap<PeerKey, Bitfield>,
    requests: HashMap<PeerKey, HashSet<(u32, u32)>>,
    rarest_first_cutoff: u32,
    mode: PickMode,
}

impl PiecePicker {
    pub fn new(info: &TorrentInfo, rarest_first_cutoff: u32) -> Self {
        let count = info.piece_count();
        let pieces = (0..count)
            .map(|i| PieceRecord {
                length: info.piece_size(i),
                priority: PiecePriority::Normal,
                blocks: Vec::new(),
                verified: false,
            })
            .collect();
        debug!("Piece picker for {} pieces, rarest-first after {}", count, rarest_first_cutoff);
        Self {
            pieces,
            availability: vec![0; count as usize],
            have: Bitfield::new(count),
            peers: HashMap::new(),
            requests: HashMap::new(),
            rarest_first_cutoff,
            mode: PickMode::Normal,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Verified pieces
    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn has(&self, piece: u32) -> bool {
        self.have.get(piece)
    }

    pub fn mode(&self) -> PickMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PickMode) {
        info!("Picker mode: {:?}", mode);
        self.mode = mode;
    }

    /// Move the sequential playback head
    pub fn set_head(&mut self, head: u32) {
        let last = self.piece_count().saturating_sub(1);
        if let PickMode::Sequential { head: h } = &mut self.mode {
            *h = head.min(last);
        }
    }

    pub fn priority(&self, piece: u32) -> PiecePriority {
        self.pieces
            .get(piece as usize)
            .map(|p| p.priority)
            .unwrap_or(PiecePriority::Skip)
    }

    pub fn set_piece_priority(&mut self, piece: u32, priority: PiecePriority) {
        if let Some(record) = self.pieces.get_mut(piece as usize) {
            record.priority = priority;
        }
    }

    /// Derive piece priorities from per-file priorities; overlapping files take the maximum
    pub fn set_file_priorities(&mut self, info: &TorrentInfo, file_priorities: &[PiecePriority]) {
        let mut derived = vec![PiecePriority::Skip; self.pieces.len()];
        for (idx, priority) in file_priorities.iter().enumerate() {
            let Some(file) = info.files.get(idx) else {
                continue;
            };
            if file.length == 0 {
                continue;
            }
            if let Some(window) = info.file_window(idx) {
                for piece in window.first_piece..=window.last_piece {
                    let slot = &mut derived[piece as usize];
                    *slot = (*slot).max(*priority);
                }
            }
        }
        for (record, priority) in self.pieces.iter_mut().zip(derived) {
            record.priority = priority;
        }
        debug!(
            "File priorities applied: {} of {} pieces wanted",
            self.pieces.iter().filter(|p| p.priority.is_wanted()).count(),
            self.pieces.len()
        );
    }

    /// Register a peer before its bitfield arrives
    pub fn add_peer(&mut self, peer: PeerKey) {
        let count = self.piece_count();
        self.peers.entry(peer).or_insert_with(|| Bitfield::new(count));
    }

    /// A peer announced one piece
    pub fn on_have(&mut self, peer: PeerKey, piece: u32) -> Result<()> {
        if piece >= self.piece_count() {
            warn!("Peer {} claims piece {} of {}", peer, piece, self.piece_count());
            return Err(TorrentError::protocol_violation_with_peer(
                format!("HAVE for piece {} beyond {} pieces", piece, self.piece_count()),
                peer.to_string(),
            )
            .into());
        }
        let count = self.piece_count();
        let bits = self.peers.entry(peer).or_insert_with(|| Bitfield::new(count));
        if !bits.get(piece) {
            bits.set(piece, true);
            self.availability[piece as usize] += 1;
        }
        Ok(())
    }

    /// A peer sent its full bitfield
    pub fn on_bitfield(&mut self, peer: PeerKey, bytes: &[u8]) -> Result<()> {
        let bits = Bitfield::from_bytes(bytes, self.piece_count())
            .map_err(|e| TorrentError::protocol_violation_with_peer(e.to_string(), peer.to_string()))?;
        self.remove_availability(&peer);
        for piece in bits.iter_ones() {
            self.availability[piece as usize] += 1;
        }
        trace!("Peer {} has {} pieces", peer, bits.count_ones());
        self.peers.insert(peer, bits);
        Ok(())
    }

    /// Peer has every piece (used for seeds learned out of band)
    pub fn on_have_all(&mut self, peer: PeerKey) {
        let bits = Bitfield::full(self.piece_count());
        self.remove_availability(&peer);
        for a in self.availability.iter_mut() {
            *a += 1;
        }
        self.peers.insert(peer, bits);
    }

    fn remove_availability(&mut self, peer: &PeerKey) {
        if let Some(old) = self.peers.get(peer) {
            for piece in old.iter_ones() {
                self.availability[piece as usize] -= 1;
            }
        }
    }

    pub fn peer_bitfield(&self, peer: &PeerKey) -> Option<&Bitfield> {
        self.peers.get(peer)
    }

    /// Whether the peer has something we want
    pub fn is_interesting(&self, peer: &PeerKey) -> bool {
        let Some(bits) = self.peers.get(peer) else {
            return false;
        };
        bits.iter_ones().any(|p| {
            let record = &self.pieces[p as usize];
            !record.verified && record.priority.is_wanted()
        })
    }

    /// Forget a peer: drop its availability and release its requests
    pub fn on_peer_disconnected(&mut self, peer: &PeerKey) {
        self.remove_availability(peer);
        self.peers.remove(peer);
        let released = self.release_requests(peer);
        debug!("Peer {} removed from picker, released {} requests", peer, released.len());
    }

    /// Cancel everything outstanding at a peer (choked, snubbed); returns what was released
    pub fn release_requests(&mut self, peer: &PeerKey) -> Vec<BlockRequest> {
        let Some(pending) = self.requests.remove(peer) else {
            return Vec::new();
        };
        let mut released = Vec::with_capacity(pending.len());
        for (piece, block) in pending {
            let record = &mut self.pieces[piece as usize];
            if let Some(BlockState::Requested(peers)) = record.blocks.get_mut(block as usize) {
                peers.retain(|p| p != peer);
                if peers.is_empty() {
                    record.blocks[block as usize] = BlockState::Missing;
                }
            }
            released.push(Self::request_for(record.length, piece, block));
        }
        released
    }

    pub fn pending_requests(&self, peer: &PeerKey) -> usize {
        self.requests.get(peer).map_or(0, HashSet::len)
    }

    fn request_for(piece_len: u64, piece: u32, block: u32) -> BlockRequest {
        BlockRequest {
            piece,
            offset: block * BLOCK_SIZE,
            length: block_length(piece_len, block),
        }
    }

    fn wanted(&self, piece: u32) -> bool {
        let record = &self.pieces[piece as usize];
        !record.verified && record.priority.is_wanted()
    }

    /// True when every wanted, unverified block is requested or received
    pub fn is_endgame(&self) -> bool {
        let mut remaining = false;
        for (i, record) in self.pieces.iter().enumerate() {
            if !self.wanted(i as u32) {
                continue;
            }
            remaining = true;
            if record.missing_blocks() > 0 {
                return false;
            }
        }
        remaining
    }

    /// Next block this peer can serve, or None
    pub fn next_block(&mut self, peer: &PeerKey) -> Option<BlockRequest> {
        let bits = self.peers.get(peer)?;

        let candidates: Vec<u32> = bits
            .iter_ones()
            .filter(|p| self.wanted(*p) && self.pieces[*p as usize].missing_blocks() > 0)
            .collect();

        let chosen = if candidates.is_empty() {
            None
        } else {
            Some(self.choose_piece(&candidates))
        };

        match chosen {
            Some(piece) => self.take_missing_block(piece, peer),
            None => self.endgame_block(peer),
        }
    }

    fn choose_piece(&self, candidates: &[u32]) -> u32 {
        let top = candidates
            .iter()
            .map(|p| self.pieces[*p as usize].priority)
            .max()
            .unwrap_or(PiecePriority::Normal);
        let best: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|p| self.pieces[*p as usize].priority == top)
            .collect();

        if let PickMode::Sequential { head } = self.mode {
            // Ascending from the head; pieces behind the head come last
            return best
                .iter()
                .copied()
                .min_by_key(|p| (*p < head, *p))
                .unwrap_or(best[0]);
        }

        if top == PiecePriority::Highest {
            return best.iter().copied().min().unwrap_or(best[0]);
        }

        if self.have.count_ones() < self.rarest_first_cutoff {
            if let Some(partial) = best.iter().copied().find(|p| self.pieces[*p as usize].started()) {
                return partial;
            }
            return best[rand::thread_rng().gen_range(0..best.len())];
        }

        best.iter()
            .copied()
            .min_by_key(|p| (self.availability[*p as usize], !self.pieces[*p as usize].started(), *p))
            .unwrap_or(best[0])
    }

    fn take_missing_block(&mut self, piece: u32, peer: &PeerKey) -> Option<BlockRequest> {
        let record = &mut self.pieces[piece as usize];
        record.ensure_blocks();
        let block = record.blocks.iter().position(|b| *b == BlockState::Missing)? as u32;
        record.blocks[block as usize] = BlockState::Requested(vec![*peer]);
        let length = record.length;
        self.requests.entry(*peer).or_default().insert((piece, block));
        let request = Self::request_for(length, piece, block);
        trace!("Requesting {:?} from {}", request, peer);
        Some(request)
    }

    /// Duplicate an outstanding request held by another peer
    fn endgame_block(&mut self, peer: &PeerKey) -> Option<BlockRequest> {
        if !self.is_endgame() {
            return None;
        }
        let bits = self.peers.get(peer)?;
        let mut pick = None;
        'outer: for piece in bits.iter_ones() {
            if !self.wanted(piece) {
                continue;
            }
            for (block, state) in self.pieces[piece as usize].blocks.iter().enumerate() {
                if let BlockState::Requested(holders) = state {
                    if !holders.contains(peer) {
                        pick = Some((piece, block as u32));
                        break 'outer;
                    }
                }
            }
        }
        let (piece, block) = pick?;
        let record = &mut self.pieces[piece as usize];
        if let BlockState::Requested(holders) = &mut record.blocks[block as usize] {
            holders.push(*peer);
        }
        let length = record.length;
        self.requests.entry(*peer).or_default().insert((piece, block));
        let request = Self::request_for(length, piece, block);
        debug!("Endgame: duplicating {:?} to {}", request, peer);
        Some(request)
    }

    /// Record a received block
    pub fn on_block_received(&mut self, piece: u32, offset: u32, length: u32, peer: &PeerKey) -> BlockOutcome {
        let Some(record) = self.pieces.get_mut(piece as usize) else {
            return BlockOutcome::Unexpected;
        };
        if offset % BLOCK_SIZE != 0 {
            return BlockOutcome::Unexpected;
        }
        let block = offset / BLOCK_SIZE;
        if block >= record.block_total() || length != block_length(record.length, block) {
            return BlockOutcome::Unexpected;
        }
        if record.verified {
            return BlockOutcome::Duplicate;
        }
        record.ensure_blocks();

        let previous = std::mem::replace(&mut record.blocks[block as usize], BlockState::Received);
        let holders = match previous {
            BlockState::Received => return BlockOutcome::Duplicate,
            BlockState::Missing => Vec::new(),
            BlockState::Requested(holders) => holders,
        };
        let piece_complete = record.all_received();
        let request = Self::request_for(record.length, piece, block);

        let mut cancels = Vec::new();
        for holder in holders {
            if let Some(set) = self.requests.get_mut(&holder) {
                set.remove(&(piece, block));
            }
            if holder != *peer {
                cancels.push((holder, request));
            }
        }
        if let Some(set) = self.requests.get_mut(peer) {
            set.remove(&(piece, block));
        }
        BlockOutcome::New { cancels, piece_complete }
    }

    /// Piece hashed correctly
    pub fn on_piece_verified(&mut self, piece: u32) {
        if let Some(record) = self.pieces.get_mut(piece as usize) {
            record.verified = true;
            record.blocks = Vec::new();
            self.have.set(piece, true);
        }
    }

    /// Piece failed its hash; every block becomes missing again
    pub fn on_piece_failed(&mut self, piece: u32) {
        if let Some(record) = self.pieces.get_mut(piece as usize) {
            record.verified = false;
            record.blocks = Vec::new();
            self.have.set(piece, false);
        }
        for set in self.requests.values_mut() {
            set.retain(|(p, _)| *p != piece);
        }
    }

    /// Load the have-set and partial pieces found at startup
    pub fn restore(&mut self, have: &Bitfield, partial: &[PieceState]) {
        for piece in have.iter_ones() {
            self.on_piece_verified(piece);
        }
        for state in partial {
            let Some(record) = self.pieces.get_mut(state.index as usize) else {
                continue;
            };
            if record.verified || state.blocks.len() != record.block_total() as usize {
                continue;
            }
            record.blocks = state
                .blocks
                .iter()
                .map(|r| if *r { BlockState::Received } else { BlockState::Missing })
                .collect();
        }
    }

    /// Pieces with received blocks that are not yet verified
    pub fn partial_pieces(&self) -> Vec<PieceState> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.verified && r.blocks.iter().any(|b| *b == BlockState::Received))
            .map(|(i, r)| PieceState {
                index: i as u32,
                blocks: r.blocks.iter().map(|b| *b == BlockState::Received).collect(),
            })
            .collect()
    }

    /// Pieces whose blocks are all in but which have not been verified yet
    pub fn complete_unverified(&self) -> Vec<u32> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.verified && r.all_received())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    pub fn availability_summary(&self) -> AvailabilitySummary {
        AvailabilitySummary::from_counts(&self.availability)
    }

    /// Bytes of wanted pieces not yet verified
    pub fn wanted_bytes_left(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|r| !r.verified && r.priority.is_wanted())
            .map(|r| r.length)
            .sum()
    }

    /// Bytes of all wanted pieces
    pub fn wanted_bytes(&self) -> u64 {
        self.pieces.iter().filter(|r| r.priority.is_wanted()).map(|r| r.length).sum()
    }

    /// Every wanted piece is verified
    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|r| r.verified || !r.priority.is_wanted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentBuilder;

    fn peer(n: u8) -> PeerKey {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn info(pieces: usize, piece_len: usize) -> TorrentInfo {
        TorrentBuilder::from_memory("p.bin", vec![0u8; pieces * piece_len], piece_len as u64)
            .build()
            .unwrap()
    }

    fn full_bits(n: u32) -> Vec<u8> {
        Bitfield::full(n).as_bytes().to_vec()
    }

    #[test]
    fn test_rejects_out_of_range_have_and_bad_bitfield() {
        let mut picker = PiecePicker::new(&info(10, 16), 0);
        assert!(picker.on_have(peer(1), 10).is_err());
        assert!(picker.on_have(peer(1), 9).is_ok());
        assert!(picker.on_bitfield(peer(2), &[0xff]).is_err());
        assert!(picker.on_bitfield(peer(2), &[0xff, 0xff]).is_err());
        assert!(picker.on_bitfield(peer(2), &[0xff, 0xc0]).is_ok());
        assert_eq!(picker.availability(9), 2);
    }

    #[test]
    fn test_rarest_first() {
        let mut picker = PiecePicker::new(&info(4, 16), 0);
        picker.on_bitfield(peer(1), &full_bits(4)).unwrap();
        picker.on_have(peer(2), 0).unwrap();
        picker.on_have(peer(2), 1).unwrap();
        picker.on_have(peer(2), 3).unwrap();
        let req = picker.next_block(&peer(1)).unwrap();
        assert_eq!(req.piece, 2);
    }

    #[test]
    fn test_partial_wins_ties() {
        let mut picker = PiecePicker::new(&info(4, BLOCK_SIZE as usize * 2), 0);
        picker.on_bitfield(peer(1), &full_bits(4)).unwrap();
        picker.on_bitfield(peer(2), &full_bits(4)).unwrap();
        let first = picker.next_block(&peer(1)).unwrap();
        let second = picker.next_block(&peer(2)).unwrap();
        assert_eq!(first.piece, second.piece);
        assert_ne!(first.offset, second.offset);
    }

    #[test]
    fn test_random_first_phase_only_returns_available() {
        let mut picker = PiecePicker::new(&info(8, 16), 4);
        picker.on_have(peer(1), 5).unwrap();
        assert_eq!(picker.next_block(&peer(1)).unwrap().piece, 5);
        assert!(picker.next_block(&peer(1)).is_none());
    }

    #[test]
    fn test_block_flow_and_duplicates() {
        let mut picker = PiecePicker::new(&info(2, 16), 0);
        picker.on_bitfield(peer(1), &full_bits(2)).unwrap();
        let req = picker.next_block(&peer(1)).unwrap();
        assert_eq!(picker.pending_requests(&peer(1)), 1);

        let outcome = picker.on_block_received(req.piece, req.offset, req.length, &peer(1));
        assert_eq!(outcome, BlockOutcome::New { cancels: vec![], piece_complete: true });
        assert_eq!(picker.on_block_received(req.piece, req.offset, req.length, &peer(1)), BlockOutcome::Duplicate);
        assert_eq!(picker.on_block_received(req.piece, 3, 1, &peer(1)), BlockOutcome::Unexpected);
        assert_eq!(picker.complete_unverified(), vec![req.piece]);

        picker.on_piece_verified(req.piece);
        assert!(picker.has(req.piece));
        assert_eq!(picker.on_block_received(req.piece, 0, 16, &peer(1)), BlockOutcome::Duplicate);
    }

    #[test]
    fn test_failed_piece_is_requested_again() {
        let mut picker = PiecePicker::new(&info(1, 16), 0);
        picker.on_bitfield(peer(1), &full_bits(1)).unwrap();
        let req = picker.next_block(&peer(1)).unwrap();
        picker.on_block_received(req.piece, req.offset, req.length, &peer(1));
        picker.on_piece_failed(0);
        assert!(!picker.has(0));
        assert_eq!(picker.next_block(&peer(1)), Some(req));
    }

    #[test]
    fn test_endgame_duplicates_and_cancels() {
        let mut picker = PiecePicker::new(&info(1, 16), 0);
        picker.on_bitfield(peer(1), &full_bits(1)).unwrap();
        picker.on_bitfield(peer(2), &full_bits(1)).unwrap();
        let req = picker.next_block(&peer(1)).unwrap();
        assert!(picker.is_endgame());
        let dup = picker.next_block(&peer(2)).unwrap();
        assert_eq!(dup, req);
        assert!(picker.next_block(&peer(2)).is_none());

        match picker.on_block_received(req.piece, req.offset, req.length, &peer(2)) {
            BlockOutcome::New { cancels, piece_complete } => {
                assert!(piece_complete);
                assert_eq!(cancels, vec![(peer(1), req)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(picker.pending_requests(&peer(1)), 0);
        assert_eq!(picker.pending_requests(&peer(2)), 0);
    }

    #[test]
    fn test_disconnect_releases_requests() {
        let mut picker = PiecePicker::new(&info(3, 16), 0);
        picker.on_bitfield(peer(1), &full_bits(3)).unwrap();
        picker.next_block(&peer(1)).unwrap();
        picker.on_peer_disconnected(&peer(1));
        assert_eq!(picker.availability(0), 0);
        assert!(!picker.is_endgame());
        picker.on_bitfield(peer(2), &full_bits(3)).unwrap();
        assert!(picker.next_block(&peer(2)).is_some());
    }

    #[test]
    fn test_sequential_with_highest_first() {
        let mut picker = PiecePicker::new(&info(10, 16), 0);
        picker.on_bitfield(peer(1), &full_bits(10)).unwrap();
        picker.set_mode(PickMode::Sequential { head: 3 });
        picker.set_piece_priority(9, PiecePriority::Highest);
        picker.set_piece_priority(3, PiecePriority::Highest);

        let order: Vec<u32> = (0..5).map(|_| picker.next_block(&peer(1)).unwrap().piece).collect();
        assert_eq!(order, vec![3, 9, 4, 5, 6]);
    }

    #[test]
    fn test_file_priorities_take_maximum() {
        let info = TorrentBuilder::from_memory_files(
            "d",
            vec![
                (vec!["a".to_string()], vec![0u8; 15]),
                (vec!["b".to_string()], vec![0u8; 15]),
            ],
            10,
        )
        .build()
        .unwrap();
        let mut picker = PiecePicker::new(&info, 0);
        picker.set_file_priorities(&info, &[PiecePriority::Skip, PiecePriority::High]);
        assert_eq!(picker.priority(0), PiecePriority::Skip);
        assert_eq!(picker.priority(1), PiecePriority::High);
        assert_eq!(picker.priority(2), PiecePriority::High);
        assert_eq!(picker.wanted_bytes(), 20);
    }

    #[test]
    fn test_skip_pieces_not_requested() {
        let mut picker = PiecePicker::new(&info(2, 16), 0);
        picker.on_bitfield(peer(1), &full_bits(2)).unwrap();
        picker.set_piece_priority(0, PiecePriority::Skip);
        assert_eq!(picker.next_block(&peer(1)).unwrap().piece, 1);
        assert!(picker.next_block(&peer(1)).is_none());
        assert!(!picker.is_interesting(&peer(3)));
    }

    #[test]
    fn test_partial_round_trip() {
        let mut picker = PiecePicker::new(&info(2, BLOCK_SIZE as usize * 2), 0);
        picker.on_bitfield(peer(1), &full_bits(2)).unwrap();
        let req = picker.next_block(&peer(1)).unwrap();
        picker.on_block_received(req.piece, req.offset, req.length, &peer(1));
        let partial = picker.partial_pieces();
        assert_eq!(partial.len(), 1);

        let mut restored = PiecePicker::new(&info(2, BLOCK_SIZE as usize * 2), 0);
        restored.restore(&Bitfield::new(2), &partial);
        assert_eq!(restored.partial_pieces(), partial);
    }
}
