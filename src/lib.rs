//! swarmcore
//!
//! BitTorrent download engine: descriptor model, piece picker, peer wire,
//! rate allocation, disk I/O with hash verification, video-on-demand streaming
//! and a session supervisor that checkpoints every download.

pub mod cli;
pub mod dht;
pub mod download;
pub mod error;
pub mod peer;
pub mod picker;
pub mod protocol;
pub mod ratelimit;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{ErrorKind, TorrentError};

pub use download::{
    DownloadConfig, DownloadHandle, DownloadMode, DownloadStatus, LogEntry, PState, SetOutcome, StateSnapshot,
    VodConfig, VodEvent, VodStream,
};
pub use picker::PiecePriority;
pub use protocol::{Bitfield, Handshake, Message, MessageId};
pub use ratelimit::Direction;
pub use session::{load_descriptor, RuntimeConfig, Session, SessionConfig};
pub use torrent::{TorrentBuilder, TorrentInfo, TorrentParser};
pub use tracker::{AnnounceRequest, AnnounceResponse, Announcer, ScrapeStats};
