//! Piece buffering
//!
//! Write buffer that holds received blocks until their piece completes or the
//! buffer fills, and a small read cache for pieces served to peers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::trace;

/// Default block size (16 KiB), the unit of `request`/`piece` messages
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Number of blocks in a piece of `piece_size` bytes
pub fn block_count(piece_size: u64) -> u32 {
    piece_size.div_ceil(BLOCK_SIZE as u64) as u32
}

/// Length of block `block` in a piece of `piece_size` bytes
pub fn block_length(piece_size: u64, block: u32) -> u32 {
    let start = block as u64 * BLOCK_SIZE as u64;
    (piece_size.saturating_sub(start)).min(BLOCK_SIZE as u64) as u32
}

/// A contiguous run of buffered bytes inside one piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedWrite {
    pub piece: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Blocks received but not yet handed to the disk writer
#[derive(Debug, Default)]
pub struct WriteBuffer {
    capacity: usize,
    buffered: usize,
    pieces: BTreeMap<u32, Vec<(u32, Vec<u8>)>>,
}

impl WriteBuffer {
    /// A capacity of 0 writes through
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffered: 0,
            pieces: BTreeMap::new(),
        }
    }

    /// Buffer a block; returns true when the buffer is over capacity
    pub fn push(&mut self, piece: u32, offset: u32, data: Vec<u8>) -> bool {
        self.buffered += data.len();
        let blocks = self.pieces.entry(piece).or_default();
        if let Some(existing) = blocks.iter_mut().find(|(o, _)| *o == offset) {
            self.buffered -= existing.1.len();
            existing.1 = data;
        } else {
            blocks.push((offset, data));
        }
        self.buffered > self.capacity
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Remove and coalesce everything buffered for one piece
    pub fn take_piece(&mut self, piece: u32) -> Vec<BufferedWrite> {
        match self.pieces.remove(&piece) {
            Some(blocks) => {
                self.buffered -= blocks.iter().map(|(_, d)| d.len()).sum::<usize>();
                coalesce(piece, blocks)
            }
            None => Vec::new(),
        }
    }

    /// Remove and coalesce everything buffered
    pub fn drain(&mut self) -> Vec<BufferedWrite> {
        let pieces = std::mem::take(&mut self.pieces);
        self.buffered = 0;
        let writes: Vec<_> = pieces
            .into_iter()
            .flat_map(|(piece, blocks)| coalesce(piece, blocks))
            .collect();
        trace!("Drained {} buffered writes", writes.len());
        writes
    }

    /// Drop buffered data of a piece that failed or was cancelled
    pub fn discard_piece(&mut self, piece: u32) {
        if let Some(blocks) = self.pieces.remove(&piece) {
            self.buffered -= blocks.iter().map(|(_, d)| d.len()).sum::<usize>();
        }
    }
}

fn coalesce(piece: u32, mut blocks: Vec<(u32, Vec<u8>)>) -> Vec<BufferedWrite> {
    blocks.sort_by_key(|(offset, _)| *offset);
    let mut out: Vec<BufferedWrite> = Vec::new();
    for (offset, data) in blocks {
        match out.last_mut() {
            Some(last) if last.offset as usize + last.data.len() == offset as usize => {
                last.data.extend_from_slice(&data);
            }
            _ => out.push(BufferedWrite { piece, offset, data }),
        }
    }
    out
}

/// Most-recently-read pieces kept for serving peer requests
#[derive(Debug, Default)]
pub struct ReadCache {
    capacity: usize,
    used: usize,
    entries: VecDeque<(u32, Arc<Vec<u8>>)>,
}

impl ReadCache {
    /// A capacity of 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            entries: VecDeque::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Slice of a cached piece, refreshing its recency
    pub fn get(&mut self, piece: u32, offset: u32, length: u32) -> Option<Vec<u8>> {
        let pos = self.entries.iter().position(|(p, _)| *p == piece)?;
        let entry = self.entries.remove(pos)?;
        let start = offset as usize;
        let end = start + length as usize;
        let slice = entry.1.get(start..end).map(<[u8]>::to_vec);
        self.entries.push_back(entry);
        slice
    }

    pub fn insert(&mut self, piece: u32, data: Arc<Vec<u8>>) {
        if data.len() > self.capacity {
            return;
        }
        self.invalidate(piece);
        self.used += data.len();
        self.entries.push_back((piece, data));
        while self.used > self.capacity {
            match self.entries.pop_front() {
                Some((_, old)) => self.used -= old.len(),
                None => break,
            }
        }
    }

    pub fn invalidate(&mut self, piece: u32) {
        if let Some(pos) = self.entries.iter().position(|(p, _)| *p == piece) {
            if let Some((_, old)) = self.entries.remove(pos) {
                self.used -= old.len();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_math() {
        assert_eq!(block_count(BLOCK_SIZE as u64 * 2 + 1), 3);
        assert_eq!(block_length(BLOCK_SIZE as u64 * 2 + 1, 2), 1);
        assert_eq!(block_length(100, 0), 100);
        assert_eq!(block_count(10), 1);
    }

    #[test]
    fn test_write_buffer_coalesces() {
        let mut buf = WriteBuffer::new(1024);
        assert!(!buf.push(3, 4, vec![2; 4]));
        assert!(!buf.push(3, 0, vec![1; 4]));
        assert!(!buf.push(3, 12, vec![3; 4]));
        assert_eq!(buf.buffered_bytes(), 12);

        let writes = buf.take_piece(3);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].offset, 0);
        assert_eq!(writes[0].data, vec![1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(writes[1].offset, 12);
        assert_eq!(buf.buffered_bytes(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_buffer_capacity_and_duplicates() {
        let mut buf = WriteBuffer::new(6);
        assert!(!buf.push(0, 0, vec![0; 4]));
        assert!(!buf.push(0, 0, vec![1; 4]));
        assert_eq!(buf.buffered_bytes(), 4);
        assert!(buf.push(1, 0, vec![0; 4]));
        assert_eq!(buf.drain().len(), 2);

        let mut through = WriteBuffer::new(0);
        assert!(through.push(0, 0, vec![1]));
    }

    #[test]
    fn test_discard() {
        let mut buf = WriteBuffer::new(100);
        buf.push(2, 0, vec![0; 10]);
        buf.discard_piece(2);
        assert_eq!(buf.buffered_bytes(), 0);
        assert!(buf.take_piece(2).is_empty());
    }

    #[test]
    fn test_read_cache_eviction() {
        let mut cache = ReadCache::new(10);
        cache.insert(0, Arc::new(vec![0; 6]));
        cache.insert(1, Arc::new(vec![1; 6]));
        assert!(cache.get(0, 0, 1).is_none());
        assert_eq!(cache.get(1, 2, 2), Some(vec![1, 1]));
        assert!(cache.get(1, 5, 4).is_none());
        cache.invalidate(1);
        assert!(cache.get(1, 0, 1).is_none());
        assert!(!ReadCache::new(0).enabled());
    }
}
