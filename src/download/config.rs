//! Download configuration
//!
//! Everything a single download is started with. The value is persisted inside
//! the checkpoint, so every field round-trips through serde.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;
use crate::peer::{ConnectionConfig, PoolLimits};
use crate::picker::PiecePriority;
use crate::protocol::MAX_MESSAGE_LEN;
use crate::ratelimit::RateFudge;
use crate::storage::{AllocPolicy, LockingPolicy, BLOCK_SIZE};
use crate::tracker::UdpRetryPolicy;

/// Result of a configuration setter on a live object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SetOutcome {
    /// The new value is already in effect
    Applied,
    /// Stored, but only takes effect after a restart
    Deferred { reason: String },
}

impl SetOutcome {
    pub fn deferred(reason: impl Into<String>) -> Self {
        SetOutcome::Deferred { reason: reason.into() }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, SetOutcome::Applied)
    }
}

/// Video-on-demand streaming parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VodConfig {
    /// File to stream
    pub file_index: usize,
    /// Bytes from the playback head fetched before anything else
    pub prebuffer_bytes: u64,
    /// Bytes at the end of the file fetched up front (container indexes live there)
    pub tail_bytes: u64,
}

impl Default for VodConfig {
    fn default() -> Self {
        Self {
            file_index: 0,
            prebuffer_bytes: 4 * 1024 * 1024,
            tail_bytes: 512 * 1024,
        }
    }
}

/// Normal swarming or sequential streaming
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    #[default]
    Normal,
    Vod(VodConfig),
}

/// Configuration of one download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Destination directory; files land at `dest_dir/<descriptor paths>`
    pub dest_dir: PathBuf,
    /// Indices of wanted files; empty means all
    pub selected_files: Vec<usize>,
    /// Per-file priority by index; files past the end are normal
    pub file_priorities: Vec<PiecePriority>,
    pub mode: DownloadMode,
    /// Anonymity hop count hint, carried through untouched
    pub hops: u32,

    /// Bytes per second, 0 for unlimited
    pub max_upload_rate: u64,
    pub max_download_rate: u64,

    pub alloc_policy: AllocPolicy,
    /// Bytes per second extended by background allocation
    pub alloc_rate: u64,
    pub locking_policy: LockingPolicy,
    /// Hash existing data at startup when no usable resume data exists
    pub check_hashes: bool,
    /// Hash a completed piece twice before accepting it
    pub double_check: bool,
    /// Hash a completed piece three times before accepting it
    pub triple_check: bool,
    /// Bytes of received blocks held in memory before they are written
    pub write_buffer_size: usize,
    /// Bytes of piece data cached for uploads
    pub read_cache_size: usize,

    pub max_connections: usize,
    pub max_incoming: usize,
    pub max_outgoing_connects: usize,
    /// Outstanding requests per peer
    pub request_backlog: u32,
    /// Largest request a peer may send us
    pub max_slice_length: u32,
    pub keepalive_interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// A peer that sends no block for this long is snubbed
    pub snub_time_secs: u64,
    pub max_uploads: usize,
    pub min_uploads: usize,
    pub round_robin_period_secs: u64,
    pub super_seeder: bool,
    pub breakup_seed_bitfield: bool,
    /// Ban the last writer of a piece that fails its hash
    pub auto_kick: bool,
    pub not_same_ip: bool,
    pub rarest_first_cutoff: u32,
    pub exclude_ips: Vec<IpAddr>,

    pub http_timeout_secs: u64,
    pub numwant: u32,
    pub udp_retry: UdpRetryPolicy,

    pub upload_rate_fudge: f64,
    pub tcp_ack_fudge: f64,
    /// Seconds of tokens a rate bucket can hold
    pub max_rate_period: f64,
    /// Exempt peers on our subnet from the session caps
    pub prioritize_local: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let fudge = RateFudge::default();
        Self {
            dest_dir: PathBuf::from("."),
            selected_files: Vec::new(),
            file_priorities: Vec::new(),
            mode: DownloadMode::Normal,
            hops: 0,
            max_upload_rate: 0,
            max_download_rate: 0,
            alloc_policy: AllocPolicy::Normal,
            alloc_rate: 2 * 1024 * 1024,
            locking_policy: LockingPolicy::WhileWriting,
            check_hashes: true,
            double_check: false,
            triple_check: false,
            write_buffer_size: 4 * 1024 * 1024,
            read_cache_size: 8 * 1024 * 1024,
            max_connections: 50,
            max_incoming: 40,
            max_outgoing_connects: 10,
            request_backlog: 16,
            max_slice_length: 2 * BLOCK_SIZE,
            keepalive_interval_secs: 120,
            connect_timeout_secs: 15,
            snub_time_secs: 60,
            max_uploads: 4,
            min_uploads: 1,
            round_robin_period_secs: 10,
            super_seeder: false,
            breakup_seed_bitfield: false,
            auto_kick: true,
            not_same_ip: false,
            rarest_first_cutoff: 2,
            exclude_ips: Vec::new(),
            http_timeout_secs: 30,
            numwant: 50,
            udp_retry: UdpRetryPolicy::default(),
            upload_rate_fudge: fudge.upload_rate_fudge,
            tcp_ack_fudge: fudge.tcp_ack_fudge,
            max_rate_period: 1.0,
            prioritize_local: false,
        }
    }
}

impl DownloadConfig {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            ..Self::default()
        }
    }

    /// Reject values no download can run with
    pub fn validate(&self) -> Result<()> {
        if self.dest_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_invalid_field("Destination cannot be empty", "dest_dir").into());
        }
        if self.max_connections == 0 {
            return Err(TorrentError::config_invalid_field("Must be at least 1", "max_connections").into());
        }
        if self.request_backlog == 0 {
            return Err(TorrentError::config_invalid_field("Must be at least 1", "request_backlog").into());
        }
        if self.max_slice_length < BLOCK_SIZE {
            return Err(TorrentError::config_invalid_field(
                format!("Must be at least {}", BLOCK_SIZE),
                "max_slice_length",
            )
            .into());
        }
        if self.keepalive_interval_secs == 0 || self.round_robin_period_secs == 0 {
            return Err(TorrentError::config_invalid_field("Intervals must be positive", "keepalive_interval_secs").into());
        }
        if self.http_timeout_secs == 0 {
            return Err(TorrentError::config_invalid_field("Must be positive", "http_timeout_secs").into());
        }
        for (value, field) in [
            (self.upload_rate_fudge, "upload_rate_fudge"),
            (self.tcp_ack_fudge, "tcp_ack_fudge"),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(TorrentError::config_invalid_field("Must be a non-negative number", field).into());
            }
        }
        if !(self.max_rate_period > 0.0 && self.max_rate_period.is_finite()) {
            return Err(TorrentError::config_invalid_field("Must be positive", "max_rate_period").into());
        }
        if let DownloadMode::Vod(vod) = &self.mode {
            if vod.prebuffer_bytes == 0 {
                return Err(TorrentError::config_invalid_field("Must be positive", "prebuffer_bytes").into());
            }
        }
        Ok(())
    }

    /// Hash passes a completed piece gets before it is accepted
    pub fn verify_checks(&self) -> u8 {
        if self.triple_check {
            3
        } else if self.double_check {
            2
        } else {
            1
        }
    }

    pub fn is_file_selected(&self, idx: usize) -> bool {
        self.selected_files.is_empty() || self.selected_files.contains(&idx)
    }

    /// Effective priority of every file: unselected files are skipped and
    /// the streamed file is never skipped
    pub fn effective_priorities(&self, file_count: usize) -> Vec<PiecePriority> {
        let vod_file = self.vod().map(|vod| vod.file_index);
        (0..file_count)
            .map(|idx| {
                let priority = if self.is_file_selected(idx) {
                    self.file_priorities.get(idx).copied().unwrap_or_default()
                } else {
                    PiecePriority::Skip
                };
                if vod_file == Some(idx) {
                    priority.max(PiecePriority::Normal)
                } else {
                    priority
                }
            })
            .collect()
    }

    /// Per-file wanted flags for a torrent with `file_count` files
    pub fn wanted_files(&self, file_count: usize) -> Vec<bool> {
        self.effective_priorities(file_count)
            .into_iter()
            .map(PiecePriority::is_wanted)
            .collect()
    }

    /// Check file indices and priorities against a torrent with `file_count` files
    pub fn validate_files(&self, file_count: usize) -> Result<()> {
        if let Some(bad) = self.selected_files.iter().find(|idx| **idx >= file_count) {
            return Err(TorrentError::config_invalid_field(
                format!("File index {} out of range ({} files)", bad, file_count),
                "selected_files",
            )
            .into());
        }
        if self.file_priorities.len() > file_count {
            return Err(TorrentError::config_invalid_field(
                format!("{} priorities for {} files", self.file_priorities.len(), file_count),
                "file_priorities",
            )
            .into());
        }
        if let Some(vod) = self.vod() {
            if vod.file_index >= file_count {
                return Err(TorrentError::config_invalid_field(
                    format!("File index {} out of range ({} files)", vod.file_index, file_count),
                    "file_index",
                )
                .into());
            }
        }
        Ok(())
    }

    pub fn vod(&self) -> Option<&VodConfig> {
        match &self.mode {
            DownloadMode::Vod(vod) => Some(vod),
            DownloadMode::Normal => None,
        }
    }

    pub fn rate_period(&self) -> Duration {
        Duration::from_secs_f64(self.max_rate_period)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn snub_time(&self) -> Duration {
        Duration::from_secs(self.snub_time_secs)
    }

    pub fn round_robin_period(&self) -> Duration {
        Duration::from_secs(self.round_robin_period_secs)
    }

    pub fn rate_fudge(&self) -> RateFudge {
        RateFudge {
            tcp_ack_fudge: self.tcp_ack_fudge,
            upload_rate_fudge: self.upload_rate_fudge,
        }
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_connections: self.max_connections,
            max_incoming: self.max_incoming,
            max_outgoing_connects: self.max_outgoing_connects,
            not_same_ip: self.not_same_ip,
        }
    }

    pub fn connection_config(&self, info_hash: [u8; 20], our_peer_id: [u8; 20], listen_port: u16) -> ConnectionConfig {
        ConnectionConfig {
            info_hash,
            our_peer_id,
            listen_port,
            request_backlog: self.request_backlog,
            max_slice_length: self.max_slice_length,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}
