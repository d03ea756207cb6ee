//! File storage module
//!
//! Maps piece reads and writes onto the torrent's files under the destination
//! directory, applying the allocation and locking policies. All methods block
//! and are meant to run on the disk worker pool.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::UNIX_EPOCH;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::{FileSpan, TorrentInfo};

/// Hidden directory holding content of unselected files
pub const UNWANTED_DIR: &str = ".unwanted";

/// Number of lock stripes used by the `while_writing` policy
const PIECE_LOCK_STRIPES: usize = 64;

/// How files are sized on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocPolicy {
    /// Extend files as data is written
    #[default]
    Normal,
    /// Extend files in the background at a configured rate
    Background,
    /// Write every byte upfront
    Preallocate,
    /// Set the final length and let the file system keep holes
    Sparse,
}

/// Read/write exclusion on the content files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingPolicy {
    /// Reads run concurrently with writes
    Never,
    /// Reads of a piece wait for writes to the same piece
    #[default]
    WhileWriting,
    /// Reads of a file wait for any write to that file
    Always,
}

/// Size and modification time of a content file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mtime: u64,
}

enum Guard<'a> {
    #[allow(dead_code)]
    Read(RwLockReadGuard<'a, ()>),
    #[allow(dead_code)]
    Write(RwLockWriteGuard<'a, ()>),
}

/// File storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    /// Torrent information
    torrent_info: Arc<TorrentInfo>,
    /// Per-file selection; unselected files live under `.unwanted`
    wanted: RwLock<Vec<bool>>,
    alloc: AllocPolicy,
    locking: LockingPolicy,
    piece_locks: Vec<RwLock<()>>,
    file_locks: Vec<RwLock<()>>,
}

impl FileStorage {
    /// Create the directory layout and size files according to `alloc`
    pub fn open(
        base_path: PathBuf,
        torrent_info: Arc<TorrentInfo>,
        wanted: Vec<bool>,
        alloc: AllocPolicy,
        locking: LockingPolicy,
    ) -> Result<Self> {
        info!(
            "Opening storage for '{}' under {} ({:?}, {:?})",
            torrent_info.name,
            base_path.display(),
            alloc,
            locking
        );
        let file_count = torrent_info.files.len();
        if wanted.len() != file_count {
            return Err(TorrentError::config_invalid_field(
                format!("{} file selections for {} files", wanted.len(), file_count),
                "selected_files",
            )
            .into());
        }

        fs::create_dir_all(&base_path).map_err(|e| {
            error!("Failed to create base directory '{}': {}", base_path.display(), e);
            TorrentError::io_error_full("Failed to create base directory", base_path.display().to_string(), e.to_string())
        })?;

        let storage = Self {
            base_path,
            torrent_info,
            wanted: RwLock::new(wanted),
            alloc,
            locking,
            piece_locks: (0..PIECE_LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
            file_locks: (0..file_count).map(|_| RwLock::new(())).collect(),
        };

        for idx in 0..file_count {
            storage.reconcile_location(idx)?;
            storage.prepare_file(idx)?;
        }
        Ok(storage)
    }

    pub fn torrent_info(&self) -> &Arc<TorrentInfo> {
        &self.torrent_info
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn alloc_policy(&self) -> AllocPolicy {
        self.alloc
    }

    fn is_wanted(&self, idx: usize) -> bool {
        let wanted = self.wanted.read().unwrap_or_else(|p| p.into_inner());
        wanted.get(idx).copied().unwrap_or(false)
    }

    /// Visible path of a file under the destination
    pub fn visible_path(&self, idx: usize) -> PathBuf {
        match self.torrent_info.file_path(idx) {
            Some(rel) => self.base_path.join(rel),
            None => self.base_path.clone(),
        }
    }

    /// Hidden path used while a file is unselected
    pub fn unwanted_path(&self, idx: usize) -> PathBuf {
        self.base_path
            .join(UNWANTED_DIR)
            .join(format!("{}-{}", self.torrent_info.info_hash_hex(), idx))
    }

    /// Where a file currently lives
    pub fn path_of(&self, idx: usize) -> PathBuf {
        if self.is_wanted(idx) {
            self.visible_path(idx)
        } else {
            self.unwanted_path(idx)
        }
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create directory '{}': {}", parent.display(), e);
                TorrentError::io_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
            })?;
        }
        Ok(())
    }

    /// Move a file that sits at the wrong location for its selection
    fn reconcile_location(&self, idx: usize) -> Result<()> {
        let (from, to) = if self.is_wanted(idx) {
            (self.unwanted_path(idx), self.visible_path(idx))
        } else {
            (self.visible_path(idx), self.unwanted_path(idx))
        };
        if from.is_file() && !to.exists() {
            Self::ensure_parent(&to)?;
            debug!("Moving {} to {}", from.display(), to.display());
            fs::rename(&from, &to).map_err(|e| {
                TorrentError::io_error_full("Failed to move file", from.display().to_string(), e.to_string())
            })?;
        }
        Ok(())
    }

    fn prepare_file(&self, idx: usize) -> Result<()> {
        let length = self.torrent_info.files[idx].length;
        let path = self.path_of(idx);
        match self.alloc {
            AllocPolicy::Sparse => {
                let file = self.open_for_write(&path)?;
                if file.metadata()?.len() < length {
                    file.set_len(length).map_err(|e| {
                        TorrentError::io_error_full("Failed to set file length", path.display().to_string(), e.to_string())
                    })?;
                }
            }
            AllocPolicy::Preallocate => {
                self.extend_file(idx, length)?;
            }
            AllocPolicy::Normal | AllocPolicy::Background => {
                if length == 0 && self.is_wanted(idx) {
                    self.open_for_write(&path)?;
                }
            }
        }
        Ok(())
    }

    fn open_for_write(&self, path: &Path) -> Result<File> {
        Self::ensure_parent(path)?;
        OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                error!("Failed to open file '{}': {}", path.display(), e);
                TorrentError::io_error_full("Failed to open file for writing", path.display().to_string(), e.to_string()).into()
            })
    }

    /// Current on-disk length of a file (0 when absent)
    pub fn allocated_len(&self, idx: usize) -> u64 {
        fs::metadata(self.path_of(idx)).map(|m| m.len()).unwrap_or(0)
    }

    /// Grow a file with zeros up to `target` bytes, never past its descriptor length.
    ///
    /// Returns the new on-disk length.
    pub fn extend_file(&self, idx: usize, target: u64) -> Result<u64> {
        let length = self.torrent_info.files[idx].length;
        let target = target.min(length);
        let path = self.path_of(idx);
        let _guard = self.file_locks[idx].write().unwrap_or_else(|p| p.into_inner());
        let mut file = self.open_for_write(&path)?;
        let current = file.metadata()?.len();
        if current >= target {
            return Ok(current);
        }
        file.seek(SeekFrom::Start(current))?;
        let zeros = vec![0u8; 64 * 1024];
        let mut remaining = target - current;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n]).map_err(|e| {
                TorrentError::io_error_full("Failed to extend file", path.display().to_string(), e.to_string())
            })?;
            remaining -= n as u64;
        }
        trace!("Extended {} to {} bytes", path.display(), target);
        Ok(target)
    }

    fn lock(lock: &RwLock<()>, write: bool) -> Guard<'_> {
        if write {
            Guard::Write(lock.write().unwrap_or_else(|p| p.into_inner()))
        } else {
            Guard::Read(lock.read().unwrap_or_else(|p| p.into_inner()))
        }
    }

    fn guards(&self, piece: u32, spans: &[FileSpan], write: bool) -> Vec<Guard<'_>> {
        match self.locking {
            LockingPolicy::Never => Vec::new(),
            LockingPolicy::WhileWriting => {
                vec![Self::lock(&self.piece_locks[piece as usize % PIECE_LOCK_STRIPES], write)]
            }
            // spans are in ascending file order, so lock order is consistent
            LockingPolicy::Always => spans
                .iter()
                .map(|s| Self::lock(&self.file_locks[s.file_index], write))
                .collect(),
        }
    }

    /// Write `data` at `offset` inside `piece`
    pub fn write(&self, piece: u32, offset: u32, data: &[u8]) -> Result<()> {
        let (start, end) = self
            .torrent_info
            .piece_range(piece)
            .ok_or_else(|| TorrentError::io_error(format!("Write to nonexistent piece {}", piece)))?;
        let abs = start + offset as u64;
        if abs + data.len() as u64 > end {
            return Err(TorrentError::io_error(format!(
                "Write of {} bytes at {} overruns piece {}",
                data.len(),
                offset,
                piece
            ))
            .into());
        }

        let spans = self.torrent_info.spans_for_range(abs, data.len() as u64);
        let _guards = self.guards(piece, &spans, true);
        for span in spans {
            let path = self.path_of(span.file_index);
            let mut file = self.open_for_write(&path)?;
            file.seek(SeekFrom::Start(span.file_offset))?;
            let chunk = &data[span.piece_offset as usize..(span.piece_offset + span.length) as usize];
            file.write_all(chunk).map_err(|e| {
                error!("Failed to write to file '{}': {}", path.display(), e);
                TorrentError::io_error_full("Failed to write to file", path.display().to_string(), e.to_string())
            })?;
        }
        trace!("Wrote {} bytes to piece {} at {}", data.len(), piece, offset);
        Ok(())
    }

    /// Read `length` bytes at `offset` inside `piece`
    pub fn read(&self, piece: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        let (start, end) = self
            .torrent_info
            .piece_range(piece)
            .ok_or_else(|| TorrentError::io_error(format!("Read from nonexistent piece {}", piece)))?;
        let abs = start + offset as u64;
        if abs + length as u64 > end {
            return Err(TorrentError::io_error(format!(
                "Read of {} bytes at {} overruns piece {}",
                length, offset, piece
            ))
            .into());
        }

        let spans = self.torrent_info.spans_for_range(abs, length as u64);
        let _guards = self.guards(piece, &spans, false);
        let mut out = vec![0u8; length as usize];
        for span in spans {
            let path = self.path_of(span.file_index);
            let mut file = File::open(&path).map_err(|e| {
                TorrentError::io_error_full("Failed to open file for reading", path.display().to_string(), e.to_string())
            })?;
            file.seek(SeekFrom::Start(span.file_offset))?;
            let dst = &mut out[span.piece_offset as usize..(span.piece_offset + span.length) as usize];
            file.read_exact(dst).map_err(|e| {
                TorrentError::io_error_full("Failed to read from file", path.display().to_string(), e.to_string())
            })?;
        }
        Ok(out)
    }

    /// SHA1 of a piece as stored on disk
    pub fn hash_piece(&self, piece: u32) -> Result<[u8; 20]> {
        let size = self.torrent_info.piece_size(piece) as u32;
        let data = self.read(piece, 0, size)?;
        Ok(Sha1::digest(&data).into())
    }

    /// Compare a stored piece against the descriptor; unreadable pieces do not verify
    pub fn verify_piece(&self, piece: u32) -> bool {
        let Some(expected) = self.torrent_info.piece_hash(piece) else {
            return false;
        };
        match self.hash_piece(piece) {
            Ok(actual) => actual == expected,
            Err(e) => {
                trace!("Piece {} unreadable: {}", piece, e);
                false
            }
        }
    }

    /// Select or unselect a file, moving its content between the visible
    /// path and the `.unwanted` area
    pub fn set_file_wanted(&self, idx: usize, wanted: bool) -> Result<()> {
        {
            let mut current = self.wanted.write().unwrap_or_else(|p| p.into_inner());
            match current.get_mut(idx) {
                Some(w) if *w == wanted => return Ok(()),
                Some(w) => *w = wanted,
                None => {
                    return Err(TorrentError::config_invalid_field(format!("No file with index {}", idx), "file_index").into())
                }
            }
        }
        let _guard = self.file_locks[idx].write().unwrap_or_else(|p| p.into_inner());
        info!("File {} is now {}", idx, if wanted { "wanted" } else { "unwanted" });
        self.reconcile_location(idx)
    }

    /// Size and mtime of a file, if it exists
    pub fn file_stat(&self, idx: usize) -> Option<FileStat> {
        let meta = fs::metadata(self.path_of(idx)).ok()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Some(FileStat { size: meta.len(), mtime })
    }

    /// End-to-end SHA1 of one file
    pub fn file_sha1(&self, idx: usize) -> Result<[u8; 20]> {
        let path = self.path_of(idx);
        let mut file = File::open(&path)
            .map_err(|e| TorrentError::io_error_full("Failed to open file", path.display().to_string(), e.to_string()))?;
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = self.torrent_info.files[idx].length;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..chunk])?;
            if n == 0 {
                return Err(TorrentError::io_error_with_path("File shorter than expected", path.display().to_string()).into());
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(hasher.finalize().into())
    }

    /// Check every file that carries an end-to-end SHA1; returns indices that failed
    pub fn verify_file_hashes(&self) -> Vec<usize> {
        let mut failed = Vec::new();
        for (idx, file) in self.torrent_info.files.iter().enumerate() {
            if let Some(expected) = file.sha1 {
                match self.file_sha1(idx) {
                    Ok(actual) if actual == expected => {}
                    Ok(_) => failed.push(idx),
                    Err(e) => {
                        warn!("Cannot hash file {}: {}", idx, e);
                        failed.push(idx);
                    }
                }
            }
        }
        failed
    }

    /// Push written data to stable storage
    pub fn sync(&self) -> Result<()> {
        for idx in 0..self.torrent_info.files.len() {
            let path = self.path_of(idx);
            if let Ok(file) = OpenOptions::new().write(true).open(&path) {
                file.sync_data().map_err(|e| {
                    TorrentError::io_error_full("Failed to sync file", path.display().to_string(), e.to_string())
                })?;
            }
        }
        Ok(())
    }

    /// Delete all content files, both visible and hidden
    pub fn remove_content(&self) -> Result<()> {
        for idx in 0..self.torrent_info.files.len() {
            for path in [self.visible_path(idx), self.unwanted_path(idx)] {
                if path.is_file() {
                    fs::remove_file(&path).map_err(|e| {
                        TorrentError::io_error_full("Failed to remove file", path.display().to_string(), e.to_string())
                    })?;
                }
            }
        }
        let mut dirs: Vec<PathBuf> = (0..self.torrent_info.files.len())
            .flat_map(|idx| [self.visible_path(idx), self.unwanted_path(idx)])
            .flat_map(|path| {
                path.ancestors()
                    .skip(1)
                    .take_while(|dir| dir.starts_with(&self.base_path) && *dir != self.base_path.as_path())
                    .map(Path::to_path_buf)
                    .collect::<Vec<_>>()
            })
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            // Fails on directories that still hold other files
            if fs::remove_dir(&dir).is_ok() {
                debug!("Removed empty directory {}", dir.display());
            }
        }
        info!("Removed content of {}", self.torrent_info.info_hash_hex());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentBuilder;

    fn multi() -> Arc<TorrentInfo> {
        Arc::new(
            TorrentBuilder::from_memory_files(
                "content",
                vec![
                    (vec!["a.bin".to_string()], (0..15u8).collect()),
                    (vec!["b.bin".to_string()], (15..25u8).collect()),
                ],
                10,
            )
            .build()
            .unwrap(),
        )
    }

    fn content() -> Vec<u8> {
        (0..25u8).collect()
    }

    #[test]
    fn test_write_read_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi();
        let storage = FileStorage::open(dir.path().to_path_buf(), info.clone(), vec![true, true], AllocPolicy::Normal, LockingPolicy::WhileWriting).unwrap();

        let data = content();
        for piece in 0..info.piece_count() {
            let (s, e) = info.piece_range(piece).unwrap();
            storage.write(piece, 0, &data[s as usize..e as usize]).unwrap();
        }
        for piece in 0..info.piece_count() {
            assert!(storage.verify_piece(piece));
        }
        assert_eq!(storage.read(1, 3, 4).unwrap(), vec![13, 14, 15, 16]);
        assert_eq!(fs::read(dir.path().join("content").join("a.bin")).unwrap(), data[..15].to_vec());
    }

    #[test]
    fn test_write_overrun_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().to_path_buf(), multi(), vec![true, true], AllocPolicy::Normal, LockingPolicy::Never).unwrap();
        assert!(storage.write(2, 0, &[0u8; 6]).is_err());
        assert!(storage.write(3, 0, &[0u8; 1]).is_err());
    }

    #[test]
    fn test_sparse_sets_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().to_path_buf(), multi(), vec![true, true], AllocPolicy::Sparse, LockingPolicy::Always).unwrap();
        assert_eq!(storage.allocated_len(0), 15);
        assert_eq!(storage.allocated_len(1), 10);
        assert!(!storage.verify_piece(0));
    }

    #[test]
    fn test_preallocate_and_extend() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().to_path_buf(), multi(), vec![true, true], AllocPolicy::Background, LockingPolicy::Never).unwrap();
        assert_eq!(storage.allocated_len(0), 0);
        assert_eq!(storage.extend_file(0, 8).unwrap(), 8);
        assert_eq!(storage.extend_file(0, 100).unwrap(), 15);

        let dir2 = tempfile::tempdir().unwrap();
        let pre = FileStorage::open(dir2.path().to_path_buf(), multi(), vec![true, true], AllocPolicy::Preallocate, LockingPolicy::Never).unwrap();
        assert_eq!(pre.allocated_len(1), 10);
    }

    #[test]
    fn test_unwanted_file_is_hidden_then_revealed() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi();
        let storage = FileStorage::open(dir.path().to_path_buf(), info.clone(), vec![true, false], AllocPolicy::Normal, LockingPolicy::WhileWriting).unwrap();

        let data = content();
        storage.write(2, 0, &data[20..25]).unwrap();
        let hidden = dir.path().join(UNWANTED_DIR).join(format!("{}-1", info.info_hash_hex()));
        assert!(hidden.is_file());
        assert!(!dir.path().join("content").join("b.bin").exists());

        storage.set_file_wanted(1, true).unwrap();
        assert!(!hidden.exists());
        assert!(dir.path().join("content").join("b.bin").is_file());
        assert_eq!(storage.read(2, 0, 5).unwrap(), data[20..25].to_vec());
    }

    #[test]
    fn test_file_sha1_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let info = Arc::new(TorrentBuilder::from_memory("one.bin", vec![9u8; 30], 16).with_file_sha1(true).build().unwrap());
        let storage = FileStorage::open(dir.path().to_path_buf(), info.clone(), vec![true], AllocPolicy::Normal, LockingPolicy::Never).unwrap();
        storage.write(0, 0, &[9u8; 16]).unwrap();
        storage.write(1, 0, &[9u8; 14]).unwrap();
        assert!(storage.verify_file_hashes().is_empty());
        assert_eq!(storage.file_stat(0).unwrap().size, 30);
        storage.sync().unwrap();

        storage.remove_content().unwrap();
        assert!(storage.file_stat(0).is_none());
    }

    #[test]
    fn test_remove_content_keeps_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi();
        let storage = FileStorage::open(dir.path().to_path_buf(), info.clone(), vec![true, false], AllocPolicy::Normal, LockingPolicy::Never).unwrap();
        let data = content();
        storage.write(0, 0, &data[..10]).unwrap();
        storage.write(2, 0, &data[20..25]).unwrap();
        let foreign = dir.path().join("content").join("notes.txt");
        std::fs::write(&foreign, b"mine").unwrap();

        storage.remove_content().unwrap();
        assert!(!dir.path().join("content").join("a.bin").exists());
        assert!(!dir.path().join(UNWANTED_DIR).exists());
        assert_eq!(std::fs::read(&foreign).unwrap(), b"mine");

        std::fs::remove_file(&foreign).unwrap();
        storage.remove_content().unwrap();
        assert!(!dir.path().join("content").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_selection_length_checked() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileStorage::open(dir.path().to_path_buf(), multi(), vec![true], AllocPolicy::Normal, LockingPolicy::Never).is_err());
    }
}
