//! Resume data module
//!
//! The engine resume blob stored inside a checkpoint, and the startup check
//! that decides which pieces can be trusted without re-hashing.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::Bitfield;
use crate::storage::file::{FileStat, FileStorage};

/// Current layout of [`EngineResumeData`]
pub const RESUME_FORMAT: u32 = 1;

/// State of a single partially downloaded piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceState {
    /// Piece index
    pub index: u32,
    /// Which blocks are on disk
    pub blocks: Vec<bool>,
}

/// Engine resume blob.
///
/// `have` is the hex of the MSB-first bitfield. `files` records the size and
/// mtime of each file at checkpoint time (`None` when the file was absent); a
/// mismatch on load invalidates every piece touching that file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResumeData {
    pub format: u32,
    pub piece_count: u32,
    pub have: String,
    #[serde(default)]
    pub partial: Vec<PieceState>,
    #[serde(default)]
    pub files: Vec<Option<FileStat>>,
}

impl EngineResumeData {
    /// Snapshot the current state of a download
    pub fn capture(storage: &FileStorage, have: &Bitfield, partial: Vec<PieceState>) -> Self {
        let files = (0..storage.torrent_info().files.len())
            .map(|idx| storage.file_stat(idx))
            .collect();
        Self {
            format: RESUME_FORMAT,
            piece_count: have.len(),
            have: have.to_hex(),
            partial,
            files,
        }
    }

    /// Decoded have-bitfield
    pub fn have_bitfield(&self) -> Result<Bitfield> {
        Bitfield::from_hex(&self.have, self.piece_count)
    }

    /// Whether this blob can describe the given layout at all
    pub fn is_usable(&self, piece_count: u32, file_count: usize) -> bool {
        self.format <= RESUME_FORMAT && self.piece_count == piece_count && self.files.len() == file_count
    }
}

/// Outcome of the startup check
#[derive(Debug, Clone)]
pub struct StartupCheck {
    pub have: Bitfield,
    pub partial: Vec<PieceState>,
    /// Pieces that were read back and hashed
    pub hashed: u32,
}

/// Decide the have-set at startup.
///
/// With a usable resume blob, pieces whose files are unchanged are trusted and
/// only pieces touching changed files are hashed. Without one, every piece is
/// hashed when `check_hashes` is set.
pub fn startup_check(
    storage: &FileStorage,
    resume: Option<&EngineResumeData>,
    check_hashes: bool,
    cancel: &AtomicBool,
    progress: &mut dyn FnMut(f64),
) -> StartupCheck {
    let info = storage.torrent_info().clone();
    let piece_count = info.piece_count();
    let file_count = info.files.len();

    let resume = resume.filter(|r| {
        let ok = r.is_usable(piece_count, file_count);
        if !ok {
            warn!("Ignoring resume data for {}: layout or format mismatch", info.info_hash_hex());
        }
        ok
    });
    let resume_have = resume.and_then(|r| r.have_bitfield().ok());

    // Per file: Some(true) when unchanged since the checkpoint
    let files_unchanged: Vec<bool> = match (resume, &resume_have) {
        (Some(r), Some(_)) => (0..file_count).map(|idx| storage.file_stat(idx) == r.files[idx]).collect(),
        _ => vec![false; file_count],
    };
    let trusted = resume_have.is_some();
    for (idx, unchanged) in files_unchanged.iter().enumerate() {
        if trusted && !unchanged {
            info!("File {} changed since last checkpoint; re-hashing its pieces", idx);
        }
    }

    let mut have = Bitfield::new(piece_count);
    let mut hashed = 0u32;
    for piece in 0..piece_count {
        if cancel.load(Ordering::Relaxed) {
            debug!("Startup check cancelled at piece {}", piece);
            break;
        }
        let spans = info.piece_spans(piece);
        let piece_unchanged = trusted && spans.iter().all(|s| files_unchanged[s.file_index]);

        if piece_unchanged {
            if resume_have.as_ref().is_some_and(|h| h.get(piece)) {
                have.set(piece, true);
            }
        } else if trusted || check_hashes {
            let present = spans.iter().all(|s| storage.allocated_len(s.file_index) >= s.file_offset + s.length);
            if present {
                hashed += 1;
                if storage.verify_piece(piece) {
                    have.set(piece, true);
                }
            }
        }
        if piece % 64 == 0 || piece + 1 == piece_count {
            progress((piece + 1) as f64 / piece_count as f64);
        }
    }

    let partial = match resume {
        Some(r) => r
            .partial
            .iter()
            .filter(|p| p.index < piece_count && !have.get(p.index))
            .filter(|p| info.piece_spans(p.index).iter().all(|s| files_unchanged[s.file_index]))
            .cloned()
            .collect(),
        None => Vec::new(),
    };

    info!(
        "Startup check for {}: {}/{} pieces present, {} hashed",
        info.info_hash_hex(),
        have.count_ones(),
        piece_count,
        hashed
    );
    StartupCheck { have, partial, hashed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::storage::file::{AllocPolicy, LockingPolicy};
    use crate::torrent::TorrentBuilder;

    fn setup(dir: &std::path::Path) -> (FileStorage, Vec<u8>) {
        let data: Vec<u8> = (0..100u8).collect();
        let info = Arc::new(TorrentBuilder::from_memory("r.bin", data.clone(), 10).build().unwrap());
        let storage = FileStorage::open(dir.to_path_buf(), info, vec![true], AllocPolicy::Normal, LockingPolicy::Never).unwrap();
        (storage, data)
    }

    fn write_pieces(storage: &FileStorage, data: &[u8], pieces: std::ops::Range<u32>) {
        for p in pieces {
            let s = p as usize * 10;
            storage.write(p, 0, &data[s..s + 10]).unwrap();
        }
    }

    #[test]
    fn test_full_hash_without_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, data) = setup(dir.path());
        write_pieces(&storage, &data, 0..5);
        let check = startup_check(&storage, None, true, &AtomicBool::new(false), &mut |_| {});
        assert_eq!(check.have.count_ones(), 5);
        assert_eq!(check.hashed, 5);

        let skipped = startup_check(&storage, None, false, &AtomicBool::new(false), &mut |_| {});
        assert_eq!(skipped.have.count_ones(), 0);
        assert_eq!(skipped.hashed, 0);
    }

    #[test]
    fn test_resume_blob_skips_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, data) = setup(dir.path());
        write_pieces(&storage, &data, 0..5);
        let mut have = Bitfield::new(10);
        for p in 0..5 {
            have.set(p, true);
        }
        let blob = EngineResumeData::capture(
            &storage,
            &have,
            vec![PieceState { index: 6, blocks: vec![true] }],
        );

        let check = startup_check(&storage, Some(&blob), true, &AtomicBool::new(false), &mut |_| {});
        assert_eq!(check.have, have);
        assert_eq!(check.hashed, 0);
        assert_eq!(check.partial.len(), 1);
    }

    #[test]
    fn test_changed_file_forces_rehash() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, data) = setup(dir.path());
        write_pieces(&storage, &data, 0..3);
        let mut have = Bitfield::new(10);
        for p in 0..3 {
            have.set(p, true);
        }
        let mut blob = EngineResumeData::capture(&storage, &have, Vec::new());
        blob.files[0] = Some(FileStat { size: 1, mtime: 1 });

        let check = startup_check(&storage, Some(&blob), false, &AtomicBool::new(false), &mut |_| {});
        assert_eq!(check.have.count_ones(), 3);
        assert_eq!(check.hashed, 3);
    }

    #[test]
    fn test_newer_format_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, data) = setup(dir.path());
        write_pieces(&storage, &data, 0..2);
        let mut blob = EngineResumeData::capture(&storage, &Bitfield::full(10), Vec::new());
        blob.format = RESUME_FORMAT + 1;
        let check = startup_check(&storage, Some(&blob), true, &AtomicBool::new(false), &mut |_| {});
        assert_eq!(check.have.count_ones(), 2);
    }

    #[test]
    fn test_json_shape() {
        let blob = EngineResumeData {
            format: RESUME_FORMAT,
            piece_count: 3,
            have: "a0".into(),
            partial: vec![],
            files: vec![None],
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert!(json.contains("\"have\":\"a0\""));
        let back: EngineResumeData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
        assert_eq!(back.have_bitfield().unwrap().iter_ones().collect::<Vec<_>>(), vec![0, 2]);
    }
}
