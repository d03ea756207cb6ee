//! Tracker client module
//!
//! Multi-tier announce with failover, HTTP and UDP transports, scrape, and
//! the per-download announce scheduler.

#[cfg(feature = "http-tracker")]
pub mod http;
pub mod response;
pub mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::session::udp::UdpMux;

pub use response::{AnnounceEvent, AnnounceRequest, AnnounceResponse, ScrapeStats};
pub use udp::{UdpAnnouncer, UdpRetryPolicy};

/// Interval used until a tracker tells us otherwise
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);
/// Delay before retrying after every tier failed
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Minimum spacing of scrape requests
pub const SCRAPE_INTERVAL: Duration = Duration::from_secs(300);

/// Transport seam for announce and scrape
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse>;

    async fn scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats>;
}

/// Dispatches on the URL scheme to the HTTP or UDP transport
#[derive(Debug, Default)]
pub struct TransportAnnouncer {
    #[cfg(feature = "http-tracker")]
    http: Option<http::HttpAnnouncer>,
    udp: Option<UdpAnnouncer>,
}

impl TransportAnnouncer {
    pub fn new(http_timeout: Duration, udp_mux: Option<Arc<UdpMux>>, retry: UdpRetryPolicy) -> Self {
        #[cfg(feature = "http-tracker")]
        let http = match http::HttpAnnouncer::new(http_timeout) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("HTTP trackers disabled: {:#}", e);
                None
            }
        };
        #[cfg(not(feature = "http-tracker"))]
        let _ = http_timeout;
        Self {
            #[cfg(feature = "http-tracker")]
            http,
            udp: udp_mux.map(|mux| UdpAnnouncer::new(mux, retry)),
        }
    }

    fn unsupported(url: &str) -> anyhow::Error {
        TorrentError::not_enabled(format!("tracker transport for {}", url)).into()
    }
}

#[async_trait]
impl Announcer for TransportAnnouncer {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        if url.starts_with("udp://") {
            return match &self.udp {
                Some(udp) => udp.announce(url, request).await,
                None => Err(Self::unsupported(url)),
            };
        }
        #[cfg(feature = "http-tracker")]
        if url.starts_with("http://") || url.starts_with("https://") {
            if let Some(http) = &self.http {
                return http.announce(url, request).await;
            }
        }
        Err(Self::unsupported(url))
    }

    async fn scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats> {
        if url.starts_with("udp://") {
            return match &self.udp {
                Some(udp) => udp.scrape(url, info_hash).await,
                None => Err(Self::unsupported(url)),
            };
        }
        #[cfg(feature = "http-tracker")]
        if url.starts_with("http://") || url.starts_with("https://") {
            if let Some(http) = &self.http {
                return http.scrape(url, info_hash).await;
            }
        }
        Err(Self::unsupported(url))
    }
}

/// Outcome of the latest announce, shown in the state snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerStatus {
    pub url: Option<String>,
    pub message: String,
    pub peers: usize,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub working: bool,
}

/// Announce state of one download across all tiers
pub struct TrackerClient {
    tiers: Vec<Vec<String>>,
    announcer: Arc<dyn Announcer>,
    /// Tier of the last successful announce, tried first next time
    preferred_tier: usize,
    interval: Duration,
    min_interval: Option<Duration>,
    tracker_ids: HashMap<String, String>,
    last_scrape: Option<Instant>,
    status: TrackerStatus,
}

impl std::fmt::Debug for TrackerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerClient")
            .field("tiers", &self.tiers)
            .field("preferred_tier", &self.preferred_tier)
            .field("interval", &self.interval)
            .finish()
    }
}

impl TrackerClient {
    /// Build from the descriptor's tiers, shuffling each tier
    pub fn new(tiers: Vec<Vec<String>>, announcer: Arc<dyn Announcer>) -> Self {
        let mut rng = rand::thread_rng();
        let tiers = tiers
            .into_iter()
            .filter(|t| !t.is_empty())
            .map(|mut t| {
                t.shuffle(&mut rng);
                t
            })
            .collect();
        Self::with_order(tiers, announcer)
    }

    /// Build keeping the given order within tiers
    pub fn with_order(tiers: Vec<Vec<String>>, announcer: Arc<dyn Announcer>) -> Self {
        Self {
            tiers,
            announcer,
            preferred_tier: 0,
            interval: DEFAULT_INTERVAL,
            min_interval: None,
            tracker_ids: HashMap::new(),
            last_scrape: None,
            status: TrackerStatus::default(),
        }
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Earliest allowed gap between announces
    pub fn min_interval(&self) -> Duration {
        self.min_interval.unwrap_or(Duration::ZERO)
    }

    pub fn status(&self) -> &TrackerStatus {
        &self.status
    }

    /// URLs in the order the next announce will try them
    pub fn attempt_order(&self) -> Vec<String> {
        let preferred = self.tiers.get(self.preferred_tier).into_iter();
        let rest = self
            .tiers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.preferred_tier)
            .map(|(_, t)| t);
        preferred.chain(rest).flatten().cloned().collect()
    }

    /// Announce to the first URL that answers; TrackerUnreachable when all fail
    pub async fn announce(&mut self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        if self.tiers.is_empty() {
            return Err(TorrentError::tracker_unreachable("No trackers configured").into());
        }
        let first = self.preferred_tier.min(self.tiers.len() - 1);
        let mut order: Vec<usize> = vec![first];
        order.extend((0..self.tiers.len()).filter(|t| *t != first));

        let mut last_error = None;
        for tier in order {
            for pos in 0..self.tiers[tier].len() {
                let url = self.tiers[tier][pos].clone();
                debug!("Announcing {:?} to {}", request.event, url);
                match self.announcer.announce(&url, request).await {
                    Ok(response) => {
                        self.on_success(tier, pos, &url, &response);
                        return Ok(response);
                    }
                    Err(e) => {
                        warn!("Tracker {} failed: {:#}", url, e);
                        last_error = Some(format!("{}: {:#}", url, e));
                    }
                }
            }
        }

        let message = last_error.unwrap_or_else(|| "no tracker answered".to_string());
        self.status = TrackerStatus {
            url: None,
            message: message.clone(),
            working: false,
            ..TrackerStatus::default()
        };
        Err(TorrentError::tracker_unreachable(format!("All trackers failed, last error {}", message)).into())
    }

    fn on_success(&mut self, tier: usize, pos: usize, url: &str, response: &AnnounceResponse) {
        let promoted = self.tiers[tier].remove(pos);
        self.tiers[tier].insert(0, promoted);
        self.preferred_tier = tier;

        self.interval = Duration::from_secs(u64::from(response.interval.max(1)));
        self.min_interval = response.min_interval.map(|m| Duration::from_secs(u64::from(m)));
        if let Some(id) = &response.tracker_id {
            self.tracker_ids.insert(url.to_string(), id.clone());
        }
        self.status = TrackerStatus {
            url: Some(url.to_string()),
            message: response.warning.clone().unwrap_or_else(|| "working".to_string()),
            peers: response.peers.len(),
            seeders: response.complete,
            leechers: response.incomplete,
            working: true,
        };
        info!(
            "Tracker {} returned {} peers, next announce in {:?}",
            url,
            response.peers.len(),
            self.interval
        );
    }

    /// Scrape the preferred tracker; None when skipped by the rate limit
    pub async fn scrape(&mut self, info_hash: &[u8; 20]) -> Result<Option<ScrapeStats>> {
        if let Some(last) = self.last_scrape {
            if last.elapsed() < SCRAPE_INTERVAL {
                return Ok(None);
            }
        }
        let Some(url) = self.attempt_order().into_iter().next() else {
            return Ok(None);
        };
        self.last_scrape = Some(Instant::now());
        let stats = self.announcer.scrape(&url, info_hash).await?;
        self.status.seeders = Some(stats.complete);
        self.status.leechers = Some(stats.incomplete);
        Ok(Some(stats))
    }
}

/// Transfer counters reported in announces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub seeding: bool,
}

/// Result of an announce delivered to the download controller
#[derive(Debug, Clone)]
pub struct TrackerUpdate {
    pub peers: Vec<SocketAddr>,
    pub status: TrackerStatus,
    pub error: Option<TorrentError>,
}

/// Commands to a running announce task
#[derive(Debug)]
pub enum TrackerCommand {
    /// Announce now, ignoring the interval once
    Reannounce,
    Scrape,
    /// Send `stopped` within the timeout and exit
    Stop { reply: oneshot::Sender<()> },
}

/// Fixed per-download announce parameters
#[derive(Debug, Clone)]
pub struct AnnounceIdentity {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub numwant: u32,
    pub ip: Option<String>,
    pub stop_timeout: Duration,
}

/// Handle to a spawned announce task
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<TrackerCommand>,
}

impl TrackerHandle {
    pub fn reannounce(&self) {
        let _ = self.tx.send(TrackerCommand::Reannounce);
    }

    pub fn scrape(&self) {
        let _ = self.tx.send(TrackerCommand::Scrape);
    }

    /// Announce `stopped` and wait for the task to finish
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(TrackerCommand::Stop { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

/// Spawn the announce loop of one download
pub fn spawn_tracker(
    client: TrackerClient,
    identity: AnnounceIdentity,
    stats: watch::Receiver<AnnounceStats>,
    updates: mpsc::UnboundedSender<TrackerUpdate>,
) -> TrackerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_tracker(client, identity, stats, updates, rx));
    TrackerHandle { tx }
}

/// How an in-flight announce was cut short
enum Interrupted {
    Stop(oneshot::Sender<()>),
    Closed,
}

async fn announce_stopped(client: &mut TrackerClient, request: &AnnounceRequest, limit: Duration) {
    match timeout(limit, client.announce(request)).await {
        Ok(Ok(_)) => debug!("Sent stopped to tracker"),
        Ok(Err(e)) => debug!("Stopped announce failed: {:#}", e),
        Err(_) => debug!("Stopped announce timed out"),
    }
}

async fn scrape_once(client: &mut TrackerClient, info_hash: &[u8; 20]) {
    match client.scrape(info_hash).await {
        Ok(Some(s)) => debug!("Scrape: {} seeders, {} leechers", s.complete, s.incomplete),
        Ok(None) => {}
        Err(e) => debug!("Scrape failed: {:#}", e),
    }
}

async fn run_tracker(
    mut client: TrackerClient,
    identity: AnnounceIdentity,
    mut stats: watch::Receiver<AnnounceStats>,
    updates: mpsc::UnboundedSender<TrackerUpdate>,
    mut commands: mpsc::UnboundedReceiver<TrackerCommand>,
) {
    let key = rand::random::<u32>();
    let request = |event: AnnounceEvent, s: AnnounceStats| AnnounceRequest {
        info_hash: identity.info_hash,
        peer_id: identity.peer_id,
        port: identity.port,
        uploaded: s.uploaded,
        downloaded: s.downloaded,
        left: s.left,
        event,
        numwant: if event == AnnounceEvent::Stopped { 0 } else { identity.numwant },
        ip: identity.ip.clone(),
        key,
    };

    let mut started_sent = false;
    // Only a download that was incomplete when the task started owes `completed`
    let mut completed_sent = stats.borrow().seeding;
    let mut next = Instant::now();
    let mut last_announce: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = sleep_until(next) => {}
            changed = stats.changed() => {
                if changed.is_err() {
                    break;
                }
                let seeding = stats.borrow().seeding;
                if !(seeding && !completed_sent && started_sent) {
                    continue;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(TrackerCommand::Reannounce) => {
                    let floor = last_announce.map(|at| at + client.min_interval());
                    next = floor.map_or_else(Instant::now, |f| f.max(Instant::now()));
                    continue;
                }
                Some(TrackerCommand::Scrape) => {
                    scrape_once(&mut client, &identity.info_hash).await;
                    continue;
                }
                Some(TrackerCommand::Stop { reply }) => {
                    if started_sent {
                        let s = *stats.borrow();
                        announce_stopped(&mut client, &request(AnnounceEvent::Stopped, s), identity.stop_timeout).await;
                    }
                    let _ = reply.send(());
                    return;
                }
                None => break,
            },
        }

        let s = *stats.borrow();
        let event = if !started_sent {
            AnnounceEvent::Started
        } else if s.seeding && !completed_sent {
            AnnounceEvent::Completed
        } else {
            AnnounceEvent::None
        };

        let current = request(event, s);
        let mut scrape_pending = false;
        let outcome = {
            let announce = client.announce(&current);
            tokio::pin!(announce);
            loop {
                tokio::select! {
                    result = &mut announce => break Ok(result),
                    cmd = commands.recv() => match cmd {
                        Some(TrackerCommand::Stop { reply }) => break Err(Interrupted::Stop(reply)),
                        Some(TrackerCommand::Scrape) => scrape_pending = true,
                        Some(TrackerCommand::Reannounce) => {}
                        None => break Err(Interrupted::Closed),
                    },
                }
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(Interrupted::Stop(reply)) => {
                debug!("Dropped {:?} announce to stop", event);
                // The tracker may already have seen the abandoned request
                let s = *stats.borrow();
                announce_stopped(&mut client, &request(AnnounceEvent::Stopped, s), identity.stop_timeout).await;
                let _ = reply.send(());
                return;
            }
            Err(Interrupted::Closed) => break,
        };

        let update = match result {
            Ok(response) => {
                match event {
                    AnnounceEvent::Started => started_sent = true,
                    AnnounceEvent::Completed => completed_sent = true,
                    _ => {}
                }
                next = if stats.borrow().seeding && !completed_sent {
                    // Finished while `started` was outstanding
                    Instant::now()
                } else {
                    Instant::now() + client.interval()
                };
                TrackerUpdate {
                    peers: response.peers,
                    status: client.status().clone(),
                    error: None,
                }
            }
            Err(e) => {
                next = Instant::now() + RETRY_INTERVAL;
                TrackerUpdate {
                    peers: Vec::new(),
                    status: client.status().clone(),
                    error: Some(TorrentError::from_anyhow(e, |m| TorrentError::tracker_unreachable(m))),
                }
            }
        };
        last_announce = Some(Instant::now());
        if updates.send(update).is_err() {
            break;
        }
        if scrape_pending {
            scrape_once(&mut client, &identity.info_hash).await;
        }
    }
    debug!("Tracker task for {} exiting", hex::encode(identity.info_hash));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory tracker set: URLs in `failing` error, others return one peer
    struct MockAnnouncer {
        failing: Vec<String>,
        calls: Mutex<Vec<(String, AnnounceEvent)>>,
    }

    impl MockAnnouncer {
        fn new(failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, AnnounceEvent)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Announcer for MockAnnouncer {
        async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
            self.calls.lock().unwrap().push((url.to_string(), request.event));
            if self.failing.iter().any(|f| f == url) {
                return Err(TorrentError::tracker_unreachable_with_url("connection refused", url).into());
            }
            Ok(AnnounceResponse {
                interval: 1800,
                peers: vec!["10.1.1.1:6881".parse().unwrap()],
                complete: Some(1),
                incomplete: Some(0),
                ..AnnounceResponse::default()
            })
        }

        async fn scrape(&self, _url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats> {
            Ok(ScrapeStats {
                complete: 4,
                incomplete: 2,
                downloaded: 9,
            })
        }
    }

    fn request(event: AnnounceEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [3; 20],
            peer_id: [4; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event,
            numwant: 50,
            ip: None,
            key: 1,
        }
    }

    fn tiers() -> Vec<Vec<String>> {
        vec![
            vec!["http://a.fail/announce".into(), "http://b.fail/announce".into()],
            vec!["http://c.ok/announce".into()],
        ]
    }

    #[tokio::test]
    async fn test_tier_failover_promotes_working_url() {
        let mock = MockAnnouncer::new(&["http://a.fail/announce", "http://b.fail/announce"]);
        let mut client = TrackerClient::new(tiers(), mock.clone());

        let resp = client.announce(&request(AnnounceEvent::Started)).await.unwrap();
        assert!(!resp.peers.is_empty());
        assert_eq!(mock.calls().len(), 3);
        assert_eq!(mock.calls()[2].0, "http://c.ok/announce");
        assert_eq!(client.attempt_order()[0], "http://c.ok/announce");
        assert_eq!(client.status().peers, 1);

        client.announce(&request(AnnounceEvent::None)).await.unwrap();
        assert_eq!(mock.calls()[3].0, "http://c.ok/announce");
        assert_eq!(mock.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_promotion_within_tier() {
        let mock = MockAnnouncer::new(&["http://a/announce"]);
        let mut client = TrackerClient::with_order(
            vec![vec!["http://a/announce".into(), "http://b/announce".into()]],
            mock.clone(),
        );
        client.announce(&request(AnnounceEvent::Started)).await.unwrap();
        assert_eq!(client.tiers()[0], vec!["http://b/announce", "http://a/announce"]);
    }

    #[tokio::test]
    async fn test_all_tiers_fail() {
        let mock = MockAnnouncer::new(&["http://a.fail/announce", "http://b.fail/announce", "http://c.ok/announce"]);
        let mut client = TrackerClient::new(tiers(), mock);
        let err = client.announce(&request(AnnounceEvent::Started)).await.unwrap_err();
        assert_eq!(crate::error::ErrorKind::of(&err), crate::error::ErrorKind::TrackerUnreachable);
        assert!(!client.status().working);
    }

    #[tokio::test]
    async fn test_scrape_rate_limited() {
        let mock = MockAnnouncer::new(&[]);
        let mut client = TrackerClient::new(tiers(), mock);
        assert_eq!(client.scrape(&[0; 20]).await.unwrap().map(|s| s.complete), Some(4));
        assert_eq!(client.scrape(&[0; 20]).await.unwrap(), None);
    }

    /// Tracker that fails its first `failures` announces, then answers
    struct FlakyAnnouncer {
        failures: Mutex<usize>,
        calls: Mutex<Vec<AnnounceEvent>>,
    }

    #[async_trait]
    impl Announcer for FlakyAnnouncer {
        async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
            self.calls.lock().unwrap().push(request.event);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TorrentError::tracker_unreachable_with_url("timed out", url).into());
            }
            Ok(AnnounceResponse {
                interval: 1800,
                ..AnnounceResponse::default()
            })
        }

        async fn scrape(&self, _url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats> {
            Ok(ScrapeStats::default())
        }
    }

    /// Tracker whose announces never finish in time
    struct StalledAnnouncer {
        delay: Duration,
        calls: Mutex<Vec<AnnounceEvent>>,
    }

    #[async_trait]
    impl Announcer for StalledAnnouncer {
        async fn announce(&self, _url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
            self.calls.lock().unwrap().push(request.event);
            tokio::time::sleep(self.delay).await;
            Ok(AnnounceResponse::default())
        }

        async fn scrape(&self, _url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats> {
            Ok(ScrapeStats::default())
        }
    }

    fn identity(stop_timeout: Duration) -> AnnounceIdentity {
        AnnounceIdentity {
            info_hash: [3; 20],
            peer_id: [4; 20],
            port: 1,
            numwant: 50,
            ip: None,
            stop_timeout,
        }
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_announce() {
        let stalled = Arc::new(StalledAnnouncer {
            delay: Duration::from_secs(120),
            calls: Mutex::new(Vec::new()),
        });
        let client = TrackerClient::new(vec![vec!["udp://slow.invalid:80".into()]], stalled.clone());
        let (_stats_tx, stats_rx) = watch::channel(AnnounceStats {
            left: 100,
            ..AnnounceStats::default()
        });
        let (up_tx, _up_rx) = mpsc::unbounded_channel();
        let handle = spawn_tracker(client, identity(Duration::from_millis(200)), stats_rx, up_tx);

        while stalled.calls.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let started = std::time::Instant::now();
        timeout(Duration::from_secs(5), handle.stop()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            *stalled.calls.lock().unwrap(),
            vec![AnnounceEvent::Started, AnnounceEvent::Stopped]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_sent_when_finished_before_started_succeeds() {
        let flaky = Arc::new(FlakyAnnouncer {
            failures: Mutex::new(1),
            calls: Mutex::new(Vec::new()),
        });
        let client = TrackerClient::new(vec![vec!["http://flaky.invalid/announce".into()]], flaky.clone());
        let (stats_tx, stats_rx) = watch::channel(AnnounceStats {
            left: 100,
            ..AnnounceStats::default()
        });
        let (up_tx, mut up_rx) = mpsc::unbounded_channel();
        let handle = spawn_tracker(client, identity(Duration::from_secs(1)), stats_rx, up_tx);

        let failed = up_rx.recv().await.unwrap();
        assert!(failed.error.is_some());
        stats_tx
            .send(AnnounceStats {
                left: 0,
                seeding: true,
                downloaded: 100,
                uploaded: 0,
            })
            .unwrap();
        // Retry of `started`, then `completed` right after it
        assert!(up_rx.recv().await.unwrap().error.is_none());
        assert!(up_rx.recv().await.unwrap().error.is_none());
        handle.stop().await;

        assert_eq!(
            *flaky.calls.lock().unwrap(),
            vec![
                AnnounceEvent::Started,
                AnnounceEvent::Started,
                AnnounceEvent::Completed,
                AnnounceEvent::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_task_sends_started_completed_stopped_once() {
        let mock = MockAnnouncer::new(&[]);
        let client = TrackerClient::new(vec![vec!["http://c.ok/announce".into()]], mock.clone());
        let (stats_tx, stats_rx) = watch::channel(AnnounceStats {
            left: 100,
            ..AnnounceStats::default()
        });
        let (up_tx, mut up_rx) = mpsc::unbounded_channel();
        let identity = AnnounceIdentity {
            info_hash: [3; 20],
            peer_id: [4; 20],
            port: 1,
            numwant: 50,
            ip: None,
            stop_timeout: Duration::from_secs(1),
        };
        let handle = spawn_tracker(client, identity, stats_rx, up_tx);

        let first = up_rx.recv().await.unwrap();
        assert_eq!(first.peers.len(), 1);

        stats_tx
            .send(AnnounceStats {
                left: 0,
                seeding: true,
                downloaded: 100,
                uploaded: 0,
            })
            .unwrap();
        up_rx.recv().await.unwrap();
        // A second change while seeding must not resend completed
        stats_tx
            .send(AnnounceStats {
                left: 0,
                seeding: true,
                downloaded: 100,
                uploaded: 5,
            })
            .unwrap();
        handle.stop().await;

        let events: Vec<AnnounceEvent> = mock.calls().into_iter().map(|(_, e)| e).collect();
        assert_eq!(
            events,
            vec![AnnounceEvent::Started, AnnounceEvent::Completed, AnnounceEvent::Stopped]
        );
    }
}
