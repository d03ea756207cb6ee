//! Offline state commands
//!
//! `--list` and `--stop` work on the checkpoint files directly, so they run
//! without binding any port. A stop written here takes effect at the next
//! session start.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use crate::download::{DownloadStatus, PState, STATE_EXTENSION};
use crate::error::TorrentError;
use crate::session::DOWNLOADS_DIR;

fn checkpoint_paths(state_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = state_dir.join(DOWNLOADS_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(&dir)
        .map_err(|e| TorrentError::io_error_full("Failed to list checkpoints", dir.display().to_string(), e.to_string()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == STATE_EXTENSION))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Every readable checkpoint in the state directory
pub fn list_downloads(state_dir: &Path) -> Result<Vec<PState>> {
    let mut states = Vec::new();
    for path in checkpoint_paths(state_dir)? {
        match PState::load(&path) {
            Ok(state) => states.push(state),
            Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
        }
    }
    Ok(states)
}

/// Mark the download whose info hash starts with `id` as stopped
pub fn stop_download(state_dir: &Path, id: &str) -> Result<PState> {
    let id = id.to_ascii_lowercase();
    let matches: Vec<PathBuf> = checkpoint_paths(state_dir)?
        .into_iter()
        .filter(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem.starts_with(&id))
        })
        .collect();
    let path = match matches.as_slice() {
        [one] => one.clone(),
        [] => {
            return Err(TorrentError::config_invalid_field(format!("No download matches {}", id), "id").into());
        }
        _ => {
            return Err(TorrentError::config_invalid_field(
                format!("{} matches {} downloads", id, matches.len()),
                "id",
            )
            .into());
        }
    };

    let mut state = PState::load(&path)?;
    if !state.status.is_stopped() {
        state.status = DownloadStatus::Stopped;
        state.save(&path)?;
        info!("Marked {} ({}) stopped", state.info_hash, state.name);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadConfig;
    use crate::error::ErrorKind;
    use crate::torrent::TorrentBuilder;
    use tempfile::TempDir;

    fn store(state_dir: &Path, name: &str) -> PState {
        let info = TorrentBuilder::from_memory(name, name.as_bytes().repeat(100), 64)
            .build()
            .unwrap();
        let dir = state_dir.join(DOWNLOADS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let state = PState::new(&info, DownloadConfig::new(state_dir), DownloadStatus::Downloading, 0.5);
        state.save(&PState::path_in(&dir, &state.info_hash)).unwrap();
        state
    }

    #[test]
    fn test_list_and_stop() {
        let dir = TempDir::new().unwrap();
        assert!(list_downloads(dir.path()).unwrap().is_empty());

        let a = store(dir.path(), "a.bin");
        store(dir.path(), "b.bin");
        assert_eq!(list_downloads(dir.path()).unwrap().len(), 2);

        let stopped = stop_download(dir.path(), &a.info_hash[..10].to_ascii_uppercase()).unwrap();
        assert_eq!(stopped.status, DownloadStatus::Stopped);
        let reloaded = list_downloads(dir.path())
            .unwrap()
            .into_iter()
            .find(|s| s.info_hash == a.info_hash)
            .unwrap();
        assert_eq!(reloaded.status, DownloadStatus::Stopped);
        assert_eq!(reloaded.progress, 0.5);
    }

    #[test]
    fn test_stop_unknown_id() {
        let dir = TempDir::new().unwrap();
        store(dir.path(), "a.bin");
        let err = stop_download(dir.path(), "zz").unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::ConfigurationInvalid);
    }
}
