//! Torrent descriptor
//!
//! The finalized, read-only view of a `.torrent` metadata dictionary plus the
//! piece and file arithmetic the rest of the engine relies on.

use std::path::{Path, PathBuf};

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{error, info};

use crate::error::TorrentError;
use crate::torrent::bencode::Value;

/// A file inside the torrent, in descriptor order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components relative to the torrent root (e.g., ["folder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
    /// Byte offset of this file within the concatenated content
    pub offset: u64,
    /// Optional end-to-end MD5 (hex), carried as metadata
    pub md5sum: Option<String>,
    /// Optional end-to-end SHA-1
    pub sha1: Option<[u8; 20]>,
    /// Optional end-to-end CRC32 (hex), carried as metadata
    pub crc32: Option<String>,
}

impl TorrentFile {
    /// Offset one past the last byte of this file
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Piece range covered by one file.
///
/// Used to translate file selections and VOD ranges into pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWindow {
    pub first_piece: u32,
    pub last_piece: u32,
    pub name: String,
}

/// Slice of a piece that lives in one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    /// Offset inside the file
    pub file_offset: u64,
    /// Offset inside the piece
    pub piece_offset: u64,
    pub length: u64,
}

/// A finalized torrent descriptor
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// SHA1 of the canonical encoding of the info dictionary
    pub info_hash: [u8; 20],
    /// Torrent name (the single file name, or the root directory)
    pub name: String,
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// One 20-byte SHA1 per piece
    pub pieces: Vec<[u8; 20]>,
    /// Files in descriptor order; single-file torrents get one synthesized entry
    pub files: Vec<TorrentFile>,
    /// Whether the info dictionary carries a `files` list
    pub multi_file: bool,
    /// Primary tracker announce URL
    pub announce: Option<String>,
    /// Tiered announce URLs, every tier non-empty
    pub announce_list: Vec<Vec<String>>,
    /// DHT bootstrap nodes as (host, port)
    pub nodes: Vec<(String, u16)>,
    /// HTTP seed URLs
    pub http_seeds: Vec<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub encoding: Option<String>,
    pub private: bool,
    /// The whole metadata dictionary, including keys this crate does not interpret
    pub meta: Value,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Length of a given piece; the last piece may be shorter
    pub fn piece_size(&self, index: u32) -> u64 {
        match self.piece_range(index) {
            Some((start, end)) => end - start,
            None => 0,
        }
    }

    /// Length of the final piece
    pub fn last_piece_length(&self) -> u64 {
        self.piece_size(self.piece_count().saturating_sub(1))
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::malformed(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ))
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: u32) -> Option<[u8; 20]> {
        self.pieces.get(index as usize).copied()
    }

    /// Get byte range `[start, end)` for a specific piece
    pub fn piece_range(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.piece_count() {
            return None;
        }

        let start = index as u64 * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_size());
        Some((start, end))
    }

    /// Piece containing the given content offset
    pub fn piece_at(&self, offset: u64) -> u32 {
        (offset / self.piece_length) as u32
    }

    /// Piece window of one file; zero-length files map onto the piece at their offset
    pub fn file_window(&self, file_index: usize) -> Option<FileWindow> {
        let file = self.files.get(file_index)?;
        let last_piece_index = self.piece_count().saturating_sub(1);
        let first_piece = self.piece_at(file.offset).min(last_piece_index);
        let last_piece = if file.length == 0 {
            first_piece
        } else {
            self.piece_at(file.end() - 1)
        };
        Some(FileWindow {
            first_piece,
            last_piece,
            name: file.path.join("/"),
        })
    }

    /// File slices making up one piece, in content order
    pub fn piece_spans(&self, index: u32) -> Vec<FileSpan> {
        let Some((start, end)) = self.piece_range(index) else {
            return Vec::new();
        };
        self.spans_for_range(start, end - start)
    }

    /// File slices covering `length` bytes starting at content offset `start`.
    ///
    /// `piece_offset` of each span is relative to `start`.
    pub fn spans_for_range(&self, start: u64, length: u64) -> Vec<FileSpan> {
        let end = start + length;
        let mut spans = Vec::new();
        for (file_index, file) in self.files.iter().enumerate() {
            if file.length == 0 || file.end() <= start || file.offset >= end {
                continue;
            }
            let lo = file.offset.max(start);
            let hi = file.end().min(end);
            spans.push(FileSpan {
                file_index,
                file_offset: lo - file.offset,
                piece_offset: lo - start,
                length: hi - lo,
            });
        }
        spans
    }

    /// Relative on-disk path of a file under the destination directory
    pub fn file_path(&self, file_index: usize) -> Option<PathBuf> {
        let file = self.files.get(file_index)?;
        let mut path = PathBuf::new();
        if self.multi_file {
            path.push(&self.name);
        }
        for component in &file.path {
            path.push(component);
        }
        Some(path)
    }

    /// Announce tiers to use: `announce-list` when present, else `[[announce]]`
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            self.announce_list.clone()
        } else if let Some(url) = &self.announce {
            vec![vec![url.clone()]]
        } else {
            Vec::new()
        }
    }

    /// The info sub-dictionary
    pub fn info_dict(&self) -> Option<&Value> {
        self.meta.get("info")
    }

    /// Canonical encoding of the whole descriptor
    pub fn to_bytes(&self) -> Vec<u8> {
        self.meta.encode()
    }

    /// Write the canonical encoding to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        info!("Saving torrent {} to {}", self.info_hash_hex(), path.display());
        std::fs::write(path, self.to_bytes()).map_err(|e| {
            error!("Failed to write torrent file '{}': {}", path.display(), e);
            TorrentError::io_error_full("Failed to write torrent file", path.display().to_string(), e.to_string())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::parser::TorrentParser;
    use crate::torrent::builder::TorrentBuilder;

    fn single(length: u64, piece_length: u64) -> TorrentInfo {
        TorrentBuilder::from_memory("f.bin", vec![7u8; length as usize], piece_length)
            .build()
            .unwrap()
    }

    #[test]
    fn test_piece_math_exact_multiple() {
        let info = single(100, 10);
        assert_eq!(info.piece_count(), 10);
        assert_eq!(info.last_piece_length(), 10);
    }

    #[test]
    fn test_piece_math_remainder() {
        let info = single(99, 10);
        assert_eq!(info.piece_count(), 10);
        assert_eq!(info.last_piece_length(), 9);
        let window = info.file_window(0).unwrap();
        assert_eq!(window.first_piece, 0);
        assert_eq!(window.last_piece, 9);

        let info = single(101, 10);
        assert_eq!(info.piece_count(), 11);
        assert_eq!(info.last_piece_length(), 1);
    }

    #[test]
    fn test_content_smaller_than_piece() {
        let info = single(5, 16);
        assert_eq!(info.piece_count(), 1);
        let window = info.file_window(0).unwrap();
        assert_eq!((window.first_piece, window.last_piece), (0, 0));
    }

    #[test]
    fn test_piece_range() {
        let info = single(1500, 1024);
        assert_eq!(info.piece_range(0), Some((0, 1024)));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_range(2), None);
    }

    #[test]
    fn test_multi_file_spans_and_windows() {
        let info = TorrentBuilder::from_memory_files(
            "dir",
            vec![
                (vec!["a.txt".to_string()], vec![1u8; 15]),
                (vec!["sub".to_string(), "b.txt".to_string()], vec![2u8; 10]),
            ],
            10,
        )
        .build()
        .unwrap();

        assert!(info.is_multi_file());
        assert_eq!(info.total_size(), 25);
        assert_eq!(info.piece_count(), 3);

        let spans = info.piece_spans(1);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], FileSpan { file_index: 0, file_offset: 10, piece_offset: 0, length: 5 });
        assert_eq!(spans[1], FileSpan { file_index: 1, file_offset: 0, piece_offset: 5, length: 5 });

        assert_eq!(info.file_window(0).unwrap().last_piece, 1);
        assert_eq!(info.file_window(1).unwrap().first_piece, 1);
        assert_eq!(info.file_window(1).unwrap().last_piece, 2);
        assert_eq!(info.file_path(1).unwrap(), PathBuf::from("dir").join("sub").join("b.txt"));
    }

    #[test]
    fn test_save_and_reload_keeps_info_hash() {
        let info = single(33, 8);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.torrent");
        info.save(&path).unwrap();
        let reloaded = TorrentParser::parse_file(&path).unwrap();
        assert_eq!(reloaded.info_hash, info.info_hash);
        assert_eq!(reloaded.to_bytes(), info.to_bytes());
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        assert!(TorrentInfo::parse_piece_hashes(&[1u8; 21]).is_err());
        assert_eq!(TorrentInfo::parse_piece_hashes(&[1u8; 40]).unwrap().len(), 2);
    }
}
