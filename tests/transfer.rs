//! Two sessions on loopback: seed, download, stream and tracker failover

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{local_addr, random_bytes, seeder, session_config, sha1, GRACE, WAIT};
use swarmcore::tracker::AnnounceEvent;
use swarmcore::{
    AnnounceRequest, AnnounceResponse, Announcer, DownloadConfig, DownloadMode, DownloadStatus, ScrapeStats,
    Session, TorrentBuilder, TorrentError, TorrentParser, VodConfig,
};
use tempfile::TempDir;

const PIECE_LENGTH: u64 = 262_144;

#[tokio::test]
async fn test_create_seed_download_round_trip() {
    let dir = TempDir::new().unwrap();
    let data = random_bytes(8 * 1024 * 1024 + 1234);
    let info = TorrentBuilder::from_memory("payload.bin", data.clone(), PIECE_LENGTH)
        .build()
        .unwrap();
    let descriptor = dir.path().join("payload.torrent");
    info.save(&descriptor).unwrap();

    let (seed_session, seed_handle) = seeder(dir.path(), &info, &data, 0).await;

    let leech_session = Session::start(session_config(&dir.path().join("leech-state"))).await.unwrap();
    let dest = dir.path().join("d2");
    let loaded = TorrentParser::parse_file(&descriptor).unwrap();
    assert_eq!(loaded.info_hash, info.info_hash);
    let handle = leech_session.add(loaded, DownloadConfig::new(&dest)).await.unwrap();
    handle.add_peer(local_addr(&seed_session));

    let done = handle.wait_for_status(DownloadStatus::Seeding, WAIT).await.unwrap();
    assert_eq!(done.progress, 1.0);
    let fetched = std::fs::read(dest.join("payload.bin")).unwrap();
    assert_eq!(fetched.len(), data.len());
    assert_eq!(sha1(&fetched), sha1(&data));
    assert!(done.seeding.total_down >= data.len() as u64);

    let seed_state = seed_handle.state();
    assert_eq!(seed_state.status, DownloadStatus::Seeding);

    leech_session.shutdown(GRACE).await;
    seed_session.shutdown(GRACE).await;
}

#[tokio::test]
async fn test_vod_reads_tail_then_middle() {
    let dir = TempDir::new().unwrap();
    let data = random_bytes(3 * 1024 * 1024 + 77);
    let info = TorrentBuilder::from_memory("clip.mp4", data.clone(), PIECE_LENGTH)
        .build()
        .unwrap();
    let (seed_session, _seed) = seeder(dir.path(), &info, &data, 0).await;

    let leech_session = Session::start(session_config(&dir.path().join("leech-state"))).await.unwrap();
    let mut config = DownloadConfig::new(dir.path().join("vod"));
    config.mode = DownloadMode::Vod(VodConfig {
        file_index: 0,
        prebuffer_bytes: 512 * 1024,
        tail_bytes: 64 * 1024,
    });
    let handle = leech_session.add(info.clone(), config).await.unwrap();
    handle
        .wait_for(|s| s.status.is_running() && s.status != DownloadStatus::Hashchecking, WAIT)
        .await
        .unwrap();
    handle.add_peer(local_addr(&seed_session));

    let mut stream = handle.open_stream().await.unwrap();
    assert_eq!(stream.len(), data.len() as u64);

    let last = tokio::time::timeout(WAIT, stream.read_at(data.len() as u64 - 1, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last, data[data.len() - 1..].to_vec());

    let middle = data.len() / 2;
    let slice = tokio::time::timeout(WAIT, stream.read_at(middle as u64, 4096))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(slice, data[middle..middle + 4096].to_vec());

    leech_session.shutdown(GRACE).await;
    seed_session.shutdown(GRACE).await;
}

/// Tracker set where listed URLs fail and the rest hand out one peer
struct ScriptedTrackers {
    failing: Vec<String>,
    peer: std::net::SocketAddr,
    calls: Mutex<Vec<(String, AnnounceEvent)>>,
}

impl ScriptedTrackers {
    fn calls(&self) -> Vec<(String, AnnounceEvent)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Announcer for ScriptedTrackers {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        self.calls.lock().unwrap().push((url.to_string(), request.event));
        if self.failing.iter().any(|f| f == url) {
            return Err(TorrentError::tracker_unreachable_with_url("connection refused", url).into());
        }
        Ok(AnnounceResponse {
            interval: 1800,
            complete: Some(1),
            incomplete: Some(1),
            peers: vec![self.peer],
            ..AnnounceResponse::default()
        })
    }

    async fn scrape(&self, _url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats> {
        Ok(ScrapeStats::default())
    }
}

#[tokio::test]
async fn test_tracker_tier_failover() {
    let a = "http://a.invalid/announce".to_string();
    let b = "http://b.invalid/announce".to_string();
    let c = "http://c.invalid/announce".to_string();

    let dir = TempDir::new().unwrap();
    let data = random_bytes(1024 * 1024);
    let info = TorrentBuilder::from_memory("tiers.bin", data.clone(), PIECE_LENGTH)
        .announce_list(vec![vec![a.clone(), b.clone()], vec![c.clone()]])
        .unwrap()
        .build()
        .unwrap();
    let (seed_session, _seed) = seeder(dir.path(), &info, &data, 0).await;

    let trackers = Arc::new(ScriptedTrackers {
        failing: vec![a.clone(), b.clone()],
        peer: local_addr(&seed_session),
        calls: Mutex::new(Vec::new()),
    });
    let mut config = session_config(&dir.path().join("leech-state"));
    config.tracker_enabled = true;
    let leech_session = Session::start_with_announcer(config, Some(trackers.clone() as Arc<dyn Announcer>))
        .await
        .unwrap();
    let handle = leech_session
        .add(info.clone(), DownloadConfig::new(dir.path().join("leech")))
        .await
        .unwrap();

    let state = handle
        .wait_for(|s| s.tracker.as_ref().is_some_and(|t| t.working), WAIT)
        .await
        .unwrap();
    let tracker = state.tracker.unwrap();
    assert_eq!(tracker.url.as_deref(), Some(c.as_str()));
    assert!(tracker.peers > 0);
    let first_cycle = trackers.calls();
    assert!(first_cycle.len() >= 3);
    assert!(first_cycle[..2].iter().all(|(url, _)| *url == a || *url == b));
    assert_eq!(first_cycle[2], (c.clone(), AnnounceEvent::Started));

    handle.reannounce();
    let calls = tokio::time::timeout(WAIT, async {
        loop {
            let calls = trackers.calls();
            if calls.len() > 3 {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
    // Every later announce starts at the promoted tracker
    assert!(calls[3..].iter().all(|(url, _)| *url == c));

    handle.wait_for_status(DownloadStatus::Seeding, WAIT).await.unwrap();
    assert_eq!(std::fs::read(dir.path().join("leech").join("tiers.bin")).unwrap(), data);

    leech_session.shutdown(GRACE).await;
    seed_session.shutdown(GRACE).await;
}
