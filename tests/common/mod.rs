//! Helpers shared by the loopback scenarios

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use sha1::{Digest, Sha1};
use swarmcore::{DownloadConfig, DownloadHandle, DownloadStatus, Session, SessionConfig, TorrentInfo};

pub const WAIT: Duration = Duration::from_secs(60);
pub const GRACE: Duration = Duration::from_secs(10);

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Loopback session on an ephemeral port with trackers and DHT off
pub fn session_config(state_dir: &Path) -> SessionConfig {
    SessionConfig {
        listen_port: 0,
        bind_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        tracker_enabled: false,
        dht_enabled: false,
        ..SessionConfig::new(state_dir)
    }
}

pub fn local_addr(session: &Session) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), session.listen_port())
}

/// Write `data` under `dir` and serve it from a fresh session
pub async fn seeder(
    dir: &Path,
    info: &TorrentInfo,
    data: &[u8],
    max_upload_rate: u64,
) -> (Arc<Session>, DownloadHandle) {
    seeder_with(dir, info, data, max_upload_rate, |_| {}).await
}

/// Like `seeder`, with the download config adjusted before the add
pub async fn seeder_with(
    dir: &Path,
    info: &TorrentInfo,
    data: &[u8],
    max_upload_rate: u64,
    tune: impl FnOnce(&mut DownloadConfig),
) -> (Arc<Session>, DownloadHandle) {
    let content = dir.join("seed");
    std::fs::create_dir_all(&content).unwrap();
    std::fs::write(content.join(&info.name), data).unwrap();

    let mut config = session_config(&dir.join("seed-state"));
    config.max_upload_rate = max_upload_rate;
    let session = Session::start(config).await.unwrap();
    let mut download = DownloadConfig::new(content);
    tune(&mut download);
    let handle = session.add(info.clone(), download).await.unwrap();
    handle.wait_for_status(DownloadStatus::Seeding, WAIT).await.unwrap();
    (session, handle)
}
