//! Download state
//!
//! The status enum, the snapshot published to observers, and the per-handle
//! log ring that records peer-level errors.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TorrentError};
use crate::peer::PeerSnapshot;
use crate::picker::AvailabilitySummary;
use crate::tracker::TrackerStatus;

/// Entries kept by a [`LogRing`]
pub const LOG_RING_CAPACITY: usize = 128;

/// Lifecycle of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    Created,
    Hashchecking,
    Downloading,
    Seeding,
    Stopped,
    StoppedOnError,
}

impl DownloadStatus {
    /// Peers, tracker and storage are live
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Hashchecking | DownloadStatus::Downloading | DownloadStatus::Seeding
        )
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, DownloadStatus::Stopped | DownloadStatus::StoppedOnError)
    }
}

/// Error attached to a snapshot or checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TorrentError> for ErrorInfo {
    fn from(err: &TorrentError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Transfer totals and share ratio
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SeedingStats {
    /// Payload bytes uploaded over the life of the download
    pub total_up: u64,
    /// Payload bytes downloaded over the life of the download
    pub total_down: u64,
    /// Seconds spent in `Seeding`
    pub time_seeding: u64,
    pub ratio: f64,
}

impl SeedingStats {
    /// Recompute the ratio; a download that never fetched anything measures against its size
    pub fn update_ratio(&mut self, content_size: u64) {
        let base = if self.total_down > 0 { self.total_down } else { content_size };
        self.ratio = if base > 0 { self.total_up as f64 / base as f64 } else { 0.0 };
    }
}

/// Streaming readiness of a VOD download
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VodStats {
    /// Fraction of the prebuffer window that is present
    pub prebuffer: f64,
    /// Fraction of the prebuffer window present without gaps from the head
    pub consecutive_prebuffer: f64,
    /// Seconds until the prebuffer is complete at the current speed
    pub estimated_playable_secs: Option<f64>,
    pub playable: bool,
}

/// Point-in-time view of a download
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub info_hash: String,
    pub name: String,
    pub status: DownloadStatus,
    /// Verified fraction of the wanted bytes
    pub progress: f64,
    /// Fraction of the startup hash check done while `Hashchecking`
    pub hashcheck_progress: f64,
    pub error: Option<ErrorInfo>,
    /// Bytes per second
    pub down_rate: f64,
    pub up_rate: f64,
    pub peer_count: usize,
    /// Only filled when a peer list was asked for
    pub peers: Option<Vec<PeerSnapshot>>,
    pub availability: AvailabilitySummary,
    pub seeding: SeedingStats,
    pub tracker: Option<TrackerStatus>,
    pub vod: Option<VodStats>,
}

/// One peer-level error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub kind: ErrorKind,
    pub peer: Option<String>,
    pub message: String,
}

/// Bounded log of peer-level errors; the oldest entry goes first
#[derive(Debug, Clone)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(LOG_RING_CAPACITY)
    }
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(LOG_RING_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, kind: ErrorKind, peer: Option<String>, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.entries.push_back(LogEntry {
            timestamp,
            kind,
            peer,
            message: message.into(),
        });
    }

    /// Record an error raised by or about a peer
    pub fn record(&mut self, err: &TorrentError, peer: Option<String>) {
        self.push(err.kind(), peer, err.to_string());
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let mut ring = LogRing::new(2);
        ring.push(ErrorKind::ProtocolViolation, None, "a");
        ring.push(ErrorKind::HashMismatch, None, "b");
        ring.push(ErrorKind::ProtocolViolation, Some("1.2.3.4:5".into()), "c");
        let entries = ring.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "b");
        assert_eq!(entries[1].peer.as_deref(), Some("1.2.3.4:5"));
    }

    #[test]
    fn test_record_uses_kind() {
        let mut ring = LogRing::default();
        ring.record(&TorrentError::protocol_violation("bad"), None);
        assert_eq!(ring.entries()[0].kind, ErrorKind::ProtocolViolation);
        assert!(ring.entries()[0].message.contains("bad"));
    }

    #[test]
    fn test_status_classes() {
        assert!(DownloadStatus::Seeding.is_running());
        assert!(!DownloadStatus::Created.is_running());
        assert!(DownloadStatus::StoppedOnError.is_stopped());
    }

    #[test]
    fn test_ratio() {
        let mut stats = SeedingStats {
            total_up: 50,
            total_down: 100,
            ..SeedingStats::default()
        };
        stats.update_ratio(1000);
        assert!((stats.ratio - 0.5).abs() < f64::EPSILON);
        stats.total_down = 0;
        stats.update_ratio(200);
        assert!((stats.ratio - 0.25).abs() < f64::EPSILON);
    }
}
