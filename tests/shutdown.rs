//! Shutdown halfway through a download and resume from the checkpoint

mod common;

use common::{local_addr, random_bytes, seeder, session_config, GRACE, WAIT};
use swarmcore::download::{PState, STATE_EXTENSION};
use swarmcore::session::DOWNLOADS_DIR;
use swarmcore::{DownloadConfig, DownloadStatus, Session, TorrentBuilder};
use tempfile::TempDir;

#[tokio::test]
async fn test_graceful_shutdown_checkpoints_progress() {
    let dir = TempDir::new().unwrap();
    let data = random_bytes(4 * 1024 * 1024);
    let info = TorrentBuilder::from_memory("half.bin", data.clone(), 262_144).build().unwrap();
    // Throttled so the leecher can be caught halfway
    let (seed_session, _seed) = seeder(dir.path(), &info, &data, 512 * 1024).await;

    let leech_state = dir.path().join("leech-state");
    let dest = dir.path().join("leech");
    let session = Session::start(session_config(&leech_state)).await.unwrap();
    let handle = session.add(info.clone(), DownloadConfig::new(&dest)).await.unwrap();
    handle.add_peer(local_addr(&seed_session));
    handle
        .wait_for(|s| s.progress >= 0.5 && s.progress < 1.0, WAIT)
        .await
        .unwrap();

    session.shutdown(GRACE).await;
    seed_session.shutdown(GRACE).await;

    let state_path = leech_state
        .join(DOWNLOADS_DIR)
        .join(format!("{}.{}", info.info_hash_hex(), STATE_EXTENSION));
    let saved = PState::load(&state_path).unwrap();
    assert_eq!(saved.status, DownloadStatus::Downloading);
    assert!(saved.progress >= 0.5 && saved.progress < 1.0, "progress {}", saved.progress);
    assert!(saved.engine_resume().is_some());

    let session = Session::start(session_config(&leech_state)).await.unwrap();
    let handle = session.get(&info.info_hash).unwrap();
    let resumed = handle
        .wait_for_status(DownloadStatus::Downloading, WAIT)
        .await
        .unwrap();
    assert!((resumed.progress - saved.progress).abs() < 1e-9);
    session.shutdown(GRACE).await;
}
