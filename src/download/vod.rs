//! Video-on-demand support
//!
//! Piece windows for the prebuffer and tail, playback readiness, the
//! start/pause/resume event stream and a seekable reader over one file.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::download::config::VodConfig;
use crate::download::state::VodStats;
use crate::error::TorrentError;
use crate::protocol::Bitfield;
use crate::storage::{DiskPool, FileStorage};
use crate::torrent::TorrentInfo;

/// Events for an external player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum VodEvent {
    Start {
        mimetype: String,
        length: u64,
        path: PathBuf,
        bitrate: Option<u64>,
    },
    Pause,
    Resume,
}

/// Pieces covering `length` bytes of file `file_index` starting at `from` (file-relative)
pub fn pieces_for_range(info: &TorrentInfo, file_index: usize, from: u64, length: u64) -> Vec<u32> {
    let Some(file) = info.files.get(file_index) else {
        return Vec::new();
    };
    if from >= file.length || length == 0 || info.piece_length == 0 {
        return Vec::new();
    }
    let start = file.offset + from;
    let end = file.offset + (from + length).min(file.length);
    let first = (start / info.piece_length) as u32;
    let last = ((end - 1) / info.piece_length) as u32;
    (first..=last).collect()
}

/// Prebuffer window at the playback head
pub fn prebuffer_pieces(info: &TorrentInfo, vod: &VodConfig, head: u64) -> Vec<u32> {
    pieces_for_range(info, vod.file_index, head, vod.prebuffer_bytes)
}

/// Tail window at the end of the file
pub fn tail_pieces(info: &TorrentInfo, vod: &VodConfig) -> Vec<u32> {
    let Some(file) = info.files.get(vod.file_index) else {
        return Vec::new();
    };
    let from = file.length.saturating_sub(vod.tail_bytes);
    pieces_for_range(info, vod.file_index, from, vod.tail_bytes)
}

/// Readiness of the prebuffer window.
///
/// Playable means the window is present without gaps and data is flowing, or
/// the whole download is complete.
pub fn vod_stats(info: &TorrentInfo, have: &Bitfield, window: &[u32], down_rate: f64, progress: f64) -> VodStats {
    let total: u64 = window.iter().map(|p| info.piece_size(*p)).sum();
    let present: u64 = window.iter().filter(|p| have.get(**p)).map(|p| info.piece_size(*p)).sum();
    let consecutive: u64 = window
        .iter()
        .take_while(|p| have.get(**p))
        .map(|p| info.piece_size(*p))
        .sum();

    let fraction = |n: u64| if total == 0 { 1.0 } else { n as f64 / total as f64 };
    let prebuffer = fraction(present);
    let consecutive_prebuffer = fraction(consecutive);
    let missing = total.saturating_sub(present);
    let estimated_playable_secs = if missing == 0 {
        Some(0.0)
    } else if down_rate > 0.0 {
        Some(missing as f64 / down_rate)
    } else {
        None
    };
    let playable = (consecutive_prebuffer >= 1.0 && down_rate > 0.0) || progress >= 1.0;
    VodStats {
        prebuffer,
        consecutive_prebuffer,
        estimated_playable_secs,
        playable,
    }
}

/// Turns readiness changes into player events
#[derive(Debug, Default)]
pub struct VodPlayback {
    started: bool,
    paused: bool,
}

impl VodPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Feed the latest stats; `start` builds the start event the first time playback becomes possible
    pub fn update(&mut self, stats: &VodStats, start: impl FnOnce() -> VodEvent) -> Option<VodEvent> {
        if !self.started {
            if stats.playable {
                self.started = true;
                return Some(start());
            }
            return None;
        }
        // After the start, only a gap at the head stalls playback
        let ready = stats.consecutive_prebuffer >= 1.0 || stats.playable;
        if self.paused && ready {
            self.paused = false;
            return Some(VodEvent::Resume);
        }
        if !self.paused && !ready {
            self.paused = true;
            return Some(VodEvent::Pause);
        }
        None
    }
}

/// Start event for file `file_index`
pub fn start_event(info: &TorrentInfo, file_index: usize, path: PathBuf) -> VodEvent {
    let length = info.files.get(file_index).map_or(0, |f| f.length);
    let mimetype = mime_guess::from_path(&path).first_or_octet_stream().to_string();
    info!("VOD start: {} ({}, {} bytes)", path.display(), mimetype, length);
    VodEvent::Start {
        mimetype,
        length,
        path,
        bitrate: None,
    }
}

/// Seekable reader over one file of a VOD download.
///
/// Reads wait until the piece under the cursor is verified. Seeking moves the
/// download's playback head so the prebuffer follows the reader.
#[derive(Debug)]
pub struct VodStream {
    storage: Arc<FileStorage>,
    pool: DiskPool,
    file_index: usize,
    file_offset: u64,
    len: u64,
    pos: u64,
    have: watch::Receiver<Bitfield>,
    head: mpsc::UnboundedSender<u64>,
}

impl VodStream {
    pub fn new(
        storage: Arc<FileStorage>,
        pool: DiskPool,
        file_index: usize,
        have: watch::Receiver<Bitfield>,
        head: mpsc::UnboundedSender<u64>,
    ) -> Result<Self> {
        let file = storage
            .torrent_info()
            .files
            .get(file_index)
            .cloned()
            .ok_or_else(|| TorrentError::config_invalid_field(format!("No file {}", file_index), "file_index"))?;
        Ok(Self {
            storage,
            pool,
            file_index,
            file_offset: file.offset,
            len: file.length,
            pos: 0,
            have,
            head,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| TorrentError::io_error("Seek before the start of the stream"))?;
        self.pos = target.min(self.len);
        trace!("VOD stream seek to {}", self.pos);
        let _ = self.head.send(self.pos);
        Ok(self.pos)
    }

    /// Read at the cursor; returns 0 at end of file
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let info = self.storage.torrent_info().clone();
        let absolute = self.file_offset + self.pos;
        let piece = (absolute / info.piece_length) as u32;
        let in_piece = absolute - piece as u64 * info.piece_length;
        let n = (buf.len() as u64)
            .min(info.piece_size(piece) - in_piece)
            .min(self.len - self.pos);

        self.wait_for(piece).await?;
        let storage = self.storage.clone();
        let data = self
            .pool
            .run(move || storage.read(piece, in_piece as u32, n as u32))
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }

    /// Read exactly `length` bytes at `offset`, waiting for data as needed
    pub async fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                return Err(TorrentError::io_error(format!("Stream ended at {}", self.pos)).into());
            }
            filled += n;
        }
        Ok(out)
    }

    async fn wait_for(&mut self, piece: u32) -> Result<()> {
        loop {
            if self.have.borrow_and_update().get(piece) {
                return Ok(());
            }
            debug!("VOD stream waiting for piece {}", piece);
            self.have
                .changed()
                .await
                .map_err(|_| TorrentError::io_error("Download stopped while streaming"))?;
        }
    }
}
