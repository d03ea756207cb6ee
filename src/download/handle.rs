//! Download handle
//!
//! Cheap, cloneable reference to a running download. Every operation is posted
//! to the download's controller task and runs there serially; state is read
//! from the latest published snapshot without a round trip.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::download::config::SetOutcome;
use crate::download::controller::Command;
use crate::download::pstate::PState;
use crate::download::state::{DownloadStatus, LogEntry, LogRing, StateSnapshot};
use crate::download::vod::{VodEvent, VodStream};
use crate::error::TorrentError;
use crate::peer::PeerSource;
use crate::picker::PiecePriority;
use crate::protocol::Handshake;
use crate::ratelimit::{Allocation, Direction};
use crate::torrent::TorrentInfo;

#[derive(Debug, Default)]
struct DesiredSpeeds {
    up: AtomicU64,
    down: AtomicU64,
}

#[derive(Clone)]
pub struct DownloadHandle {
    info: Arc<TorrentInfo>,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<StateSnapshot>,
    vod_events: broadcast::Sender<VodEvent>,
    log: Arc<Mutex<LogRing>>,
    cancel_check: Arc<AtomicBool>,
    desired: Arc<DesiredSpeeds>,
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("info_hash", &self.info.info_hash_hex())
            .field("status", &self.snapshots.borrow().status)
            .finish()
    }
}

fn task_gone() -> TorrentError {
    TorrentError::not_possible_at_runtime("download task has shut down")
}

impl DownloadHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: Arc<TorrentInfo>,
        commands: mpsc::UnboundedSender<Command>,
        snapshots: watch::Receiver<StateSnapshot>,
        vod_events: broadcast::Sender<VodEvent>,
        log: Arc<Mutex<LogRing>>,
        cancel_check: Arc<AtomicBool>,
        max_upload_rate: u64,
        max_download_rate: u64,
    ) -> Self {
        let desired = DesiredSpeeds {
            up: AtomicU64::new(max_upload_rate),
            down: AtomicU64::new(max_download_rate),
        };
        Self {
            info,
            commands,
            snapshots,
            vod_events,
            log,
            cancel_check,
            desired: Arc::new(desired),
        }
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        self.info.info_hash_hex()
    }

    /// The controller task has exited
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| task_gone())?;
        Ok(rx.await.map_err(|_| task_gone())?)
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Command for {} dropped: task has exited", self.info_hash_hex());
        }
    }

    /// Latest published snapshot, without the peer list
    pub fn state(&self) -> StateSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshots.clone()
    }

    /// Fresh snapshot taken on the controller task
    pub async fn snapshot(&self, with_peers: bool) -> Result<StateSnapshot> {
        self.request(|reply| Command::Snapshot { with_peers, reply }).await
    }

    /// Stop the download; an ongoing hash check is abandoned
    pub async fn stop(&self, remove_state: bool, remove_content: bool) -> Result<()> {
        self.cancel_check.store(true, Ordering::SeqCst);
        self.request(|reply| Command::Stop {
            remove_state,
            remove_content,
            reply,
        })
        .await?
    }

    pub async fn restart(&self) -> Result<()> {
        self.request(|reply| Command::Restart { reply }).await?
    }

    /// Flush storage and write the state file; returns what was written
    pub async fn checkpoint(&self) -> Result<PState> {
        self.request(|reply| Command::Checkpoint { reply }).await?
    }

    /// Call `callback` with snapshots until it asks to stop.
    ///
    /// The callback returns `(next_delay_secs, want_peer_list)`. A delay of zero
    /// or less ends the loop, as does the download task going away.
    pub fn set_state_callback<F>(&self, mut callback: F, with_peer_list: bool) -> JoinHandle<()>
    where
        F: FnMut(&StateSnapshot) -> (f64, bool) + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut want_peers = with_peer_list;
            loop {
                let snapshot = if want_peers {
                    match handle.snapshot(true).await {
                        Ok(snapshot) => snapshot,
                        Err(_) => handle.state(),
                    }
                } else {
                    handle.state()
                };
                let (delay, peers) = callback(&snapshot);
                if !(delay > 0.0) || handle.is_closed() {
                    break;
                }
                want_peers = peers;
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            debug!("State callback for {} finished", handle.info_hash_hex());
        })
    }

    /// Cap one direction of this download; 0 removes the cap
    pub fn set_max_desired_speed(&self, dir: Direction, rate: u64) {
        match dir {
            Direction::Up => self.desired.up.store(rate, Ordering::SeqCst),
            Direction::Down => self.desired.down.store(rate, Ordering::SeqCst),
        }
        self.post(Command::SetMaxSpeed { dir, rate });
    }

    pub fn get_max_desired_speed(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Up => self.desired.up.load(Ordering::SeqCst),
            Direction::Down => self.desired.down.load(Ordering::SeqCst),
        }
    }

    /// Choose the files to fetch; an empty list selects every file
    pub async fn set_selected_files(&self, files: Vec<usize>) -> Result<SetOutcome> {
        self.request(|reply| Command::SetSelectedFiles { files, reply }).await?
    }

    /// Priority per file index; `Skip` leaves a file out like deselecting it
    pub async fn set_file_priorities(&self, priorities: Vec<PiecePriority>) -> Result<SetOutcome> {
        self.request(|reply| Command::SetFilePriorities { priorities, reply }).await?
    }

    /// Peer-level errors, oldest first
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.lock().map(|ring| ring.entries()).unwrap_or_default()
    }

    pub fn add_peers(&self, addrs: Vec<SocketAddr>, source: PeerSource) {
        self.post(Command::AddPeers { addrs, source });
    }

    pub fn add_peer(&self, addr: SocketAddr) {
        self.add_peers(vec![addr], PeerSource::Manual);
    }

    pub fn reannounce(&self) {
        self.post(Command::Reannounce);
    }

    pub fn scrape(&self) {
        self.post(Command::Scrape);
    }

    /// Seekable reader over the VOD file
    pub async fn open_stream(&self) -> Result<VodStream> {
        self.request(|reply| Command::OpenStream { reply }).await?
    }

    pub fn subscribe_vod(&self) -> broadcast::Receiver<VodEvent> {
        self.vod_events.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&StateSnapshot) -> bool,
        timeout: Duration,
    ) -> Result<StateSnapshot> {
        let mut rx = self.snapshots.clone();
        let wait = async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if predicate(&snapshot) {
                        return Ok(snapshot.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(task_gone());
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TorrentError::io_error(format!(
                "Timed out waiting on {} (status {:?})",
                self.info_hash_hex(),
                self.snapshots.borrow().status
            ))
            .into()),
        }
    }

    pub async fn wait_for_status(&self, status: DownloadStatus, timeout: Duration) -> Result<StateSnapshot> {
        self.wait_for(|s| s.status == status, timeout).await
    }

    /// Hand over an accepted connection whose handshake named this download
    pub(crate) fn incoming(&self, stream: TcpStream, addr: SocketAddr, handshake: Handshake) -> bool {
        self.commands
            .send(Command::Incoming {
                stream,
                addr,
                handshake,
            })
            .is_ok()
    }

    pub(crate) fn set_allocation(&self, allocation: Allocation) {
        self.post(Command::SetAllocation(allocation));
    }

    /// Tear the download down and end its task
    pub async fn shutdown(&self, checkpoint: bool) {
        self.cancel_check.store(true, Ordering::SeqCst);
        if self.request(|reply| Command::Shutdown { checkpoint, reply }).await.is_err() {
            debug!("{} already shut down", self.info_hash_hex());
        }
    }
}
