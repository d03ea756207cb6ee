//! Download module
//!
//! One download: its configuration, the controller task that runs it, the
//! handle callers hold, checkpoints and video-on-demand streaming.

pub mod config;
pub mod controller;
pub mod handle;
pub mod pstate;
pub mod state;
pub mod vod;

pub use config::{DownloadConfig, DownloadMode, SetOutcome, VodConfig};
pub use controller::{spawn_download, EngineContext};
pub use handle::DownloadHandle;
pub use pstate::{write_atomic, PState, PSTATE_VERSION, STATE_EXTENSION};
pub use state::{DownloadStatus, ErrorInfo, LogEntry, LogRing, SeedingStats, StateSnapshot, VodStats};
pub use vod::{VodEvent, VodStream};
