//! Checkpoint files
//!
//! A PState is the JSON document written to `<hex_info_hash>.state`. It carries
//! a version tag, the descriptor, the download configuration, the last status
//! and an opaque engine resume blob. Writes go to a temporary sibling first and
//! are renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::download::config::DownloadConfig;
use crate::download::state::{DownloadStatus, ErrorInfo, SeedingStats};
use crate::error::TorrentError;
use crate::storage::EngineResumeData;
use crate::torrent::{TorrentInfo, TorrentParser};

/// Version written by this build. Version 1 lacked `error` and `seeding`.
pub const PSTATE_VERSION: u32 = 2;

/// Extension of checkpoint files
pub const STATE_EXTENSION: &str = "state";

/// Persisted resume state of one download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PState {
    pub version: u32,
    pub info_hash: String,
    pub name: String,
    /// Hex of the canonical descriptor bytes
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub config: DownloadConfig,
    pub status: DownloadStatus,
    pub progress: f64,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub seeding: SeedingStats,
    /// Opaque to everything but the storage layer
    #[serde(default)]
    pub engine_resume_data: Option<serde_json::Value>,
}

impl PState {
    pub fn new(info: &TorrentInfo, config: DownloadConfig, status: DownloadStatus, progress: f64) -> Self {
        Self {
            version: PSTATE_VERSION,
            info_hash: info.info_hash_hex(),
            name: info.name.clone(),
            descriptor: Some(hex::encode(info.to_bytes())),
            config,
            status,
            progress,
            error: None,
            seeding: SeedingStats::default(),
            engine_resume_data: None,
        }
    }

    /// `dir/<hex_info_hash>.state`
    pub fn path_in(dir: &Path, info_hash_hex: &str) -> PathBuf {
        dir.join(format!("{}.{}", info_hash_hex, STATE_EXTENSION))
    }

    pub fn set_engine_resume(&mut self, data: Option<&EngineResumeData>) {
        self.engine_resume_data = data.and_then(|d| serde_json::to_value(d).ok());
    }

    /// Decoded engine blob; None when absent or of an unknown shape
    pub fn engine_resume(&self) -> Option<EngineResumeData> {
        let value = self.engine_resume_data.clone()?;
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Discarding engine resume data for {}: {}", self.info_hash, e);
                None
            }
        }
    }

    /// The embedded descriptor, if the checkpoint carries one
    pub fn descriptor(&self) -> Result<Option<TorrentInfo>> {
        let Some(encoded) = &self.descriptor else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded)
            .map_err(|e| TorrentError::state_corruption(format!("Descriptor is not hex: {}", e), self.info_hash.clone()))?;
        let info = TorrentParser::parse_bytes(&bytes)?;
        if info.info_hash_hex() != self.info_hash {
            return Err(TorrentError::state_corruption("Descriptor does not match the info hash", self.info_hash.clone()).into());
        }
        Ok(Some(info))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        debug!("Checkpoint for {} written to {}", self.info_hash, path.display());
        Ok(())
    }

    /// Read a checkpoint.
    ///
    /// Files from older versions load with defaults for the missing fields. A
    /// newer version keeps the fields this build understands and drops the
    /// engine blob so the next start re-hashes.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .map_err(|e| TorrentError::io_error_full("Failed to read checkpoint", path.display().to_string(), e.to_string()))?;
        let corrupt = |msg: String| TorrentError::state_corruption(msg, path.display().to_string());

        let value: serde_json::Value =
            serde_json::from_slice(&data).map_err(|e| corrupt(format!("Checkpoint is not JSON: {}", e)))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| corrupt("Checkpoint has no version tag".to_string()))?;

        let mut state: PState =
            serde_json::from_value(value).map_err(|e| corrupt(format!("Checkpoint does not decode: {}", e)))?;
        if version > u64::from(PSTATE_VERSION) {
            info!(
                "Checkpoint {} has version {} (newer than {}); resume data dropped",
                path.display(),
                version,
                PSTATE_VERSION
            );
            state.engine_resume_data = None;
        }
        state.version = PSTATE_VERSION;
        state.progress = state.progress.clamp(0.0, 1.0);
        Ok(state)
    }
}

/// Write `bytes` to a temporary sibling of `path`, sync it, then rename it over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| TorrentError::io_error_full("Failed to create directory", parent.display().to_string(), e.to_string()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TorrentError::io_error_with_path("Not a file path", path.display().to_string()))?;
    let tmp = parent.join(format!(".{}.tmp", file_name));

    let write = || -> std::io::Result<()> {
        use std::io::Write;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        TorrentError::io_error_full("Atomic write failed", path.display().to_string(), e.to_string())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::Bitfield;
    use crate::torrent::TorrentBuilder;
    use tempfile::TempDir;

    fn sample() -> TorrentInfo {
        TorrentBuilder::from_memory("sample.bin", vec![3u8; 100], 16).build().unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let info = sample();
        let mut state = PState::new(&info, DownloadConfig::new("/dl"), DownloadStatus::Downloading, 0.5);
        let resume = EngineResumeData {
            format: crate::storage::RESUME_FORMAT,
            piece_count: info.piece_count(),
            have: Bitfield::new(info.piece_count()).to_hex(),
            partial: Vec::new(),
            files: vec![None],
        };
        state.set_engine_resume(Some(&resume));

        let path = PState::path_in(dir.path(), &info.info_hash_hex());
        state.save(&path).unwrap();
        let loaded = PState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.engine_resume(), Some(resume));
        assert_eq!(loaded.descriptor().unwrap().unwrap().info_hash, info.info_hash);
        assert!(!dir.path().join(format!(".{}.state.tmp", info.info_hash_hex())).exists());
    }

    #[test]
    fn test_loads_previous_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.state");
        fs::write(
            &path,
            r#"{"version": 1, "info_hash": "ab", "name": "x", "status": "stopped", "progress": 1.0,
                "engine_resume_data": {"format": 1, "piece_count": 0, "have": "", "files": []}}"#,
        )
        .unwrap();
        let state = PState::load(&path).unwrap();
        assert_eq!(state.status, DownloadStatus::Stopped);
        assert_eq!(state.seeding, SeedingStats::default());
        assert!(state.engine_resume().is_some());
        assert!(state.descriptor().unwrap().is_none());
    }

    #[test]
    fn test_newer_version_drops_blob() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.state");
        fs::write(
            &path,
            r#"{"version": 99, "info_hash": "ab", "name": "x", "status": "seeding", "progress": 1.0,
                "future_field": true, "engine_resume_data": {"opaque": 1}}"#,
        )
        .unwrap();
        let state = PState::load(&path).unwrap();
        assert_eq!(state.status, DownloadStatus::Seeding);
        assert!(state.engine_resume_data.is_none());
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.state");
        fs::write(&path, b"{not json").unwrap();
        let err = PState::load(&path).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::StateCorruption);

        fs::write(&path, br#"{"info_hash": "ab"}"#).unwrap();
        assert_eq!(ErrorKind::of(&PState::load(&path).unwrap_err()), ErrorKind::StateCorruption);
    }
}
