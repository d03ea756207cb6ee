//! Download controller
//!
//! One actor task per download. The task owns storage, picker, peer pool and
//! the announce task. Peer connections, the disk writer, the tracker and the
//! DHT post into its inbox, and every handle operation arrives as a
//! [`Command`], so all state transitions of a download run serially here.
//! Blocking work (opening storage, hash checks, reads for uploads) goes to the
//! session's [`DiskPool`].

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::dht::{resolve_contacts, Dht, Query};
use crate::download::config::{DownloadConfig, SetOutcome, VodConfig};
use crate::download::handle::DownloadHandle;
use crate::download::pstate::PState;
use crate::download::state::{DownloadStatus, ErrorInfo, LogRing, SeedingStats, StateSnapshot, VodStats};
use crate::download::vod::{self, VodEvent, VodPlayback, VodStream};
use crate::error::{ErrorKind, TorrentError};
use crate::peer::{
    extension_handshake, initial_announcement, ChokeCandidate, ChokeState, Choker, ConnectionConfig, PeerConnection,
    PeerEntry, PeerEvent, PeerEventSender, PeerPool, PeerSnapshot, PeerSource, SuperSeeder,
};
use crate::picker::{BlockOutcome, BlockRequest, PickMode, PiecePicker, PiecePriority};
use crate::protocol::extension::UT_PEX;
use crate::protocol::{Bitfield, Handshake, Message};
use crate::ratelimit::{is_local_peer, Allocation, BucketPair, Direction, PeerLimiter, RateMeter};
use crate::storage::{
    startup_check, AllocPolicy, DiskEvent, DiskJob, DiskPool, DiskWriter, EngineResumeData, FileStorage, ReadCache,
    StartupCheck, WriteBuffer,
};
use crate::torrent::TorrentInfo;
use crate::tracker::{
    spawn_tracker, AnnounceIdentity, AnnounceStats, Announcer, TrackerClient, TrackerHandle, TrackerStatus, TrackerUpdate,
};

const TICK: Duration = Duration::from_secs(1);
/// Buffered blocks older than this are written even below capacity
const WRITE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DHT_LOOKUP_INTERVAL: Duration = Duration::from_secs(300);
/// Writer jobs queued before request backlogs are halved
const WRITER_BACKLOG: usize = 64;

/// Session-owned resources a download runs with
#[derive(Clone)]
pub struct EngineContext {
    pub peer_id: [u8; 20],
    pub listen_port: u16,
    /// Directory holding `<hex_info_hash>.state`
    pub state_dir: PathBuf,
    pub disk: DiskPool,
    /// Session-wide rate buckets
    pub global: BucketPair,
    /// None disables tracker announces
    pub announcer: Option<Arc<dyn Announcer>>,
    pub dht: Option<Arc<Dht>>,
    /// `ip` sent to trackers
    pub tracker_ip: Option<String>,
    /// Our address, for `prioritize_local`
    pub local_ip: Option<IpAddr>,
    pub checkpoint_interval: Duration,
}

/// Operations posted by a [`DownloadHandle`]
pub(crate) enum Command {
    Stop {
        remove_state: bool,
        remove_content: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        reply: oneshot::Sender<Result<()>>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<PState>>,
    },
    Snapshot {
        with_peers: bool,
        reply: oneshot::Sender<StateSnapshot>,
    },
    SetMaxSpeed {
        dir: Direction,
        rate: u64,
    },
    SetAllocation(Allocation),
    SetSelectedFiles {
        files: Vec<usize>,
        reply: oneshot::Sender<Result<SetOutcome>>,
    },
    SetFilePriorities {
        priorities: Vec<PiecePriority>,
        reply: oneshot::Sender<Result<SetOutcome>>,
    },
    AddPeers {
        addrs: Vec<SocketAddr>,
        source: PeerSource,
    },
    Incoming {
        stream: TcpStream,
        addr: SocketAddr,
        handshake: Handshake,
    },
    Reannounce,
    Scrape,
    OpenStream {
        reply: oneshot::Sender<Result<VodStream>>,
    },
    /// Tear down and end the task; `checkpoint` keeps the last status on disk
    Shutdown {
        checkpoint: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Piece data read for uploads
struct UploadRead {
    addr: SocketAddr,
    piece: u32,
    data: Result<Arc<Vec<u8>>>,
}

/// Receivers the actor selects over
struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    peers: mpsc::UnboundedReceiver<(SocketAddr, PeerEvent)>,
    disk: mpsc::UnboundedReceiver<DiskEvent>,
    tracker: mpsc::UnboundedReceiver<TrackerUpdate>,
    found: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
    uploads: mpsc::UnboundedReceiver<UploadRead>,
    heads: mpsc::UnboundedReceiver<u64>,
}

struct PeerSession {
    conn: PeerConnection,
    entry: PeerEntry,
    choke: ChokeState,
    incoming: bool,
    ready: bool,
    down: RateMeter,
    up: RateMeter,
    /// Last block received, or when requests started after an idle spell
    last_block: Instant,
    /// `reqq` from the peer's extension handshake
    reqq: Option<u32>,
    /// Requests from the peer not yet served
    uploads: VecDeque<BlockRequest>,
    reading: bool,
}

impl PeerSession {
    fn new(conn: PeerConnection, entry: PeerEntry, incoming: bool) -> Self {
        Self {
            conn,
            entry,
            choke: ChokeState::default(),
            incoming,
            ready: false,
            down: RateMeter::default(),
            up: RateMeter::default(),
            last_block: Instant::now(),
            reqq: None,
            uploads: VecDeque::new(),
            reading: false,
        }
    }
}

struct VodRuntime {
    config: VodConfig,
    window: Vec<u32>,
    tail: Vec<u32>,
    playback: VodPlayback,
    stats: VodStats,
}

/// Everything that exists only while a download runs
struct Engine {
    storage: Arc<FileStorage>,
    writer: DiskWriter,
    writer_task: JoinHandle<()>,
    disk: DiskPool,
    picker: PiecePicker,
    pool: PeerPool,
    peers: HashMap<SocketAddr, PeerSession>,
    choker: Choker,
    super_seeder: Option<SuperSeeder>,
    tracker: Option<TrackerHandle>,
    announce_stats: Option<watch::Sender<AnnounceStats>>,
    write_buffer: WriteBuffer,
    read_cache: ReadCache,
    conn_config: Arc<ConnectionConfig>,
    down_meter: RateMeter,
    up_meter: RateMeter,
    base_backlog: u32,
    verify_checks: u8,
    /// Peer that delivered the latest block of each unverified piece
    last_writer: HashMap<u32, SocketAddr>,
    vod: Option<VodRuntime>,
    last_rechoke: Instant,
    last_flush: Instant,
    last_dht: Option<Instant>,
    alloc_cursor: usize,
    alloc_inflight: bool,
}

impl Engine {
    fn ready_peers(&self) -> Vec<SocketAddr> {
        self.peers.iter().filter(|(_, s)| s.ready).map(|(a, _)| *a).collect()
    }

    fn disk_congested(&self) -> bool {
        self.disk.is_congested() || self.writer.pending() > WRITER_BACKLOG
    }

    /// Keep the peer's request pipeline full
    fn fill_requests(&mut self, addr: SocketAddr) {
        let congested = self.disk_congested();
        let Some(session) = self.peers.get_mut(&addr) else {
            return;
        };
        if !session.ready || !session.choke.can_request() {
            return;
        }
        let mut limit = self.base_backlog;
        if congested {
            limit = (limit / 2).max(1);
        }
        if session.entry.flags.snubbed {
            limit = 1;
        }
        if let Some(reqq) = session.reqq {
            limit = limit.min(reqq.max(1));
        }
        if self.picker.pending_requests(&addr) == 0 {
            session.last_block = Instant::now();
        }
        while self.picker.pending_requests(&addr) < limit as usize {
            let Some(req) = self.picker.next_block(&addr) else {
                break;
            };
            session.conn.send(Message::Request {
                index: req.piece,
                begin: req.offset,
                length: req.length,
            });
        }
    }

    fn fill_all(&mut self) {
        for addr in self.ready_peers() {
            self.fill_requests(addr);
        }
    }

    fn update_interest(&mut self, addr: SocketAddr) {
        let interesting = self.picker.is_interesting(&addr);
        let Some(session) = self.peers.get_mut(&addr) else {
            return;
        };
        if !session.ready || interesting == session.choke.am_interested {
            return;
        }
        session.choke.am_interested = interesting;
        session.conn.send(if interesting {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    /// Hand every buffered block to the writer
    fn flush_buffer(&mut self) -> Result<()> {
        for write in self.write_buffer.drain() {
            self.writer.submit(DiskJob::Write {
                piece: write.piece,
                offset: write.offset,
                data: write.data,
            })?;
        }
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Forget a peer whose connection is gone or being dropped
    fn detach(&mut self, addr: SocketAddr, retry: bool) -> Option<PeerSession> {
        let session = self.peers.remove(&addr)?;
        self.picker.on_peer_disconnected(&addr);
        if let Some(ss) = self.super_seeder.as_mut() {
            ss.remove_peer(&addr);
        }
        self.pool.mark_disconnected(addr, retry);
        Some(session)
    }

    /// Move the VOD prebuffer to `head` (file-relative bytes)
    fn set_vod_head(&mut self, info: &TorrentInfo, head: u64) {
        let Some(rt) = self.vod.as_mut() else {
            return;
        };
        for piece in std::mem::take(&mut rt.window) {
            if !rt.tail.contains(&piece) && self.picker.priority(piece) == PiecePriority::Highest {
                self.picker.set_piece_priority(piece, PiecePriority::Normal);
            }
        }
        rt.window = vod::prebuffer_pieces(info, &rt.config, head);
        for piece in rt.window.iter().chain(rt.tail.iter()) {
            if self.picker.priority(*piece).is_wanted() {
                self.picker.set_piece_priority(*piece, PiecePriority::Highest);
            }
        }
        if let Some(first) = rt.window.first() {
            self.picker.set_head(*first);
        }
        debug!("VOD head at byte {}, prebuffer pieces {:?}", head, rt.window);
    }

    /// Re-mark the VOD prebuffer and tail after priorities were recomputed
    fn restore_vod_priority(&mut self) {
        let Some(rt) = self.vod.as_ref() else {
            return;
        };
        for piece in rt.window.iter().chain(rt.tail.iter()) {
            if self.picker.priority(*piece).is_wanted() {
                self.picker.set_piece_priority(*piece, PiecePriority::Highest);
            }
        }
    }

    fn peer_snapshots(&mut self) -> Vec<PeerSnapshot> {
        let picker = &self.picker;
        self.peers
            .iter_mut()
            .filter(|(_, s)| s.ready)
            .map(|(addr, s)| PeerSnapshot {
                id: s.entry.peer_id_hex(),
                state: s.conn.state(),
                ip: addr.ip().to_string(),
                port: addr.port(),
                flags: s.entry.flags,
                choke: s.choke,
                up_rate: s.up.rate(),
                down_rate: s.down.rate(),
                have_fraction: picker
                    .peer_bitfield(addr)
                    .filter(|b| !b.is_empty())
                    .map_or(0.0, |b| b.count_ones() as f64 / b.len() as f64),
                client_name: s.entry.peer_id.map(|id| Handshake::client_name(&id)).unwrap_or_default(),
            })
            .collect()
    }
}

struct Controller {
    info: Arc<TorrentInfo>,
    config: DownloadConfig,
    ctx: EngineContext,
    status: DownloadStatus,
    error: Option<ErrorInfo>,
    progress: f64,
    resume: Option<EngineResumeData>,
    stats: SeedingStats,
    seeding_since: Option<Instant>,
    download_buckets: BucketPair,
    allocation: Allocation,
    tracker_status: Option<TrackerStatus>,
    engine: Option<Engine>,
    /// Kept after a stop so content can still be removed
    storage: Option<Arc<FileStorage>>,
    log: Arc<Mutex<LogRing>>,
    snapshot_tx: Arc<watch::Sender<StateSnapshot>>,
    vod_tx: broadcast::Sender<VodEvent>,
    have_tx: watch::Sender<Bitfield>,
    cancel_check: Arc<AtomicBool>,
    peer_tx: PeerEventSender,
    disk_tx: mpsc::UnboundedSender<DiskEvent>,
    tracker_tx: mpsc::UnboundedSender<TrackerUpdate>,
    found_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    upload_tx: mpsc::UnboundedSender<UploadRead>,
    head_tx: mpsc::UnboundedSender<u64>,
    last_checkpoint: Instant,
}

/// Start the actor of one download.
///
/// `restored` seeds status, statistics and resume data from a checkpoint.
/// With `autostart` the download begins hash checking at once.
pub fn spawn_download(
    info: Arc<TorrentInfo>,
    config: DownloadConfig,
    ctx: EngineContext,
    restored: Option<PState>,
    autostart: bool,
) -> (DownloadHandle, JoinHandle<()>) {
    let (cmd_tx, commands) = mpsc::unbounded_channel();
    let (peer_tx, peers) = mpsc::unbounded_channel();
    let (disk_tx, disk) = mpsc::unbounded_channel();
    let (tracker_tx, tracker) = mpsc::unbounded_channel();
    let (found_tx, found) = mpsc::unbounded_channel();
    let (upload_tx, uploads) = mpsc::unbounded_channel();
    let (head_tx, heads) = mpsc::unbounded_channel();
    let inbox = Inbox {
        commands,
        peers,
        disk,
        tracker,
        found,
        uploads,
        heads,
    };

    let mut status = DownloadStatus::Created;
    let mut progress = 0.0;
    let mut error = None;
    let mut stats = SeedingStats::default();
    let mut resume = None;
    if let Some(state) = &restored {
        status = state.status;
        progress = state.progress;
        error = state.error.clone();
        stats = state.seeding;
        resume = state.engine_resume();
    }

    let (snapshot_tx, snapshot_rx) = watch::channel(StateSnapshot {
        info_hash: info.info_hash_hex(),
        name: info.name.clone(),
        status,
        progress,
        error: error.clone(),
        seeding: stats,
        ..StateSnapshot::default()
    });
    let (vod_tx, _) = broadcast::channel(16);
    let (have_tx, _) = watch::channel(Bitfield::new(info.piece_count()));
    let log = Arc::new(Mutex::new(LogRing::default()));
    let cancel_check = Arc::new(AtomicBool::new(false));
    let download_buckets = BucketPair::new(config.max_upload_rate, config.max_download_rate, config.rate_period());

    let handle = DownloadHandle::new(
        info.clone(),
        cmd_tx,
        snapshot_rx,
        vod_tx.clone(),
        log.clone(),
        cancel_check.clone(),
        config.max_upload_rate,
        config.max_download_rate,
    );
    let controller = Controller {
        info,
        config,
        ctx,
        status,
        error,
        progress,
        resume,
        stats,
        seeding_since: None,
        download_buckets,
        allocation: Allocation::default(),
        tracker_status: None,
        engine: None,
        storage: None,
        log,
        snapshot_tx: Arc::new(snapshot_tx),
        vod_tx,
        have_tx,
        cancel_check,
        peer_tx,
        disk_tx,
        tracker_tx,
        found_tx,
        upload_tx,
        head_tx,
        last_checkpoint: Instant::now(),
    };
    let task = tokio::spawn(controller.run(inbox, autostart));
    (handle, task)
}

fn limiter_for(
    config: &DownloadConfig,
    ctx: &EngineContext,
    download: &BucketPair,
    addr: SocketAddr,
) -> PeerLimiter {
    let exempt = config.prioritize_local && is_local_peer(&addr, ctx.local_ip);
    PeerLimiter::new(
        BucketPair::unlimited(config.rate_period()),
        download.clone(),
        ctx.global.clone(),
        config.rate_fudge(),
        exempt,
    )
}

impl Controller {
    fn hex(&self) -> String {
        self.info.info_hash_hex()
    }

    async fn run(mut self, mut inbox: Inbox, autostart: bool) {
        if autostart {
            self.start().await;
        }
        self.publish();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = inbox.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles to {} dropped", self.hex());
                        self.shutdown(true).await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Some((addr, event)) = inbox.peers.recv() => self.on_peer_event(addr, event),
                Some(event) = inbox.disk.recv() => self.on_disk_event(event).await,
                Some(update) = inbox.tracker.recv() => self.on_tracker_update(update),
                Some(addrs) = inbox.found.recv() => self.add_peers(addrs, PeerSource::Dht),
                Some(read) = inbox.uploads.recv() => self.on_upload_read(read),
                Some(head) = inbox.heads.recv() => {
                    let info = self.info.clone();
                    if let Some(engine) = self.engine.as_mut() {
                        engine.set_vod_head(&info, head);
                        engine.fill_all();
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
        debug!("Controller for {} exited", self.hex());
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Stop {
                remove_state,
                remove_content,
                reply,
            } => {
                let _ = reply.send(self.stop(remove_state, remove_content).await);
            }
            Command::Restart { reply } => {
                self.cancel_check.store(false, Ordering::SeqCst);
                self.start().await;
                let result = match (&self.error, self.status) {
                    (Some(e), DownloadStatus::StoppedOnError) => {
                        Err(TorrentError::io_error(format!("Restart failed: {}", e.message)).into())
                    }
                    _ => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Checkpoint { reply } => {
                let _ = reply.send(self.checkpoint().await);
            }
            Command::Snapshot { with_peers, reply } => {
                let _ = reply.send(self.snapshot(with_peers));
            }
            Command::SetMaxSpeed { dir, rate } => {
                match dir {
                    Direction::Up => self.config.max_upload_rate = rate,
                    Direction::Down => self.config.max_download_rate = rate,
                }
                self.apply_rates().await;
            }
            Command::SetAllocation(allocation) => {
                if allocation != self.allocation {
                    self.allocation = allocation;
                    self.apply_rates().await;
                }
            }
            Command::SetSelectedFiles { files, reply } => {
                let _ = reply.send(self.set_selected_files(files).await);
            }
            Command::SetFilePriorities { priorities, reply } => {
                let _ = reply.send(self.set_file_priorities(priorities).await);
            }
            Command::AddPeers { addrs, source } => self.add_peers(addrs, source),
            Command::Incoming {
                stream,
                addr,
                handshake,
            } => self.on_incoming(stream, addr, handshake),
            Command::Reannounce => {
                if let Some(tracker) = self.engine.as_ref().and_then(|e| e.tracker.as_ref()) {
                    tracker.reannounce();
                }
            }
            Command::Scrape => {
                if let Some(tracker) = self.engine.as_ref().and_then(|e| e.tracker.as_ref()) {
                    tracker.scrape();
                }
            }
            Command::OpenStream { reply } => {
                let _ = reply.send(self.open_stream());
            }
            Command::Shutdown { checkpoint, reply } => {
                self.shutdown(checkpoint).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        self.publish();
        ControlFlow::Continue(())
    }

    // ---- lifecycle ----

    async fn start(&mut self) {
        if self.engine.is_some() {
            return;
        }
        self.error = None;
        self.status = DownloadStatus::Hashchecking;
        self.publish();
        match self.build_engine().await {
            Ok(engine) => self.run_engine(engine),
            Err(e) if self.cancel_check.load(Ordering::SeqCst) => {
                info!("Start of {} cancelled: {:#}", self.hex(), e);
                self.status = DownloadStatus::Stopped;
            }
            Err(e) => {
                let err = TorrentError::from_anyhow(e, TorrentError::io_error);
                self.fail(err).await;
            }
        }
    }

    /// Open storage, run the startup check and assemble the engine
    async fn build_engine(&mut self) -> Result<Engine> {
        let info = self.info.clone();
        let config = self.config.clone();
        let priorities = config.effective_priorities(info.files.len());
        let wanted: Vec<bool> = priorities.iter().map(|p| p.is_wanted()).collect();

        let (st_info, dest, st_wanted) = (info.clone(), config.dest_dir.clone(), wanted.clone());
        let (alloc, locking) = (config.alloc_policy, config.locking_policy);
        let storage = Arc::new(
            self.ctx
                .disk
                .run(move || FileStorage::open(dest, st_info, st_wanted, alloc, locking))
                .await?,
        );
        self.storage = Some(storage.clone());

        let resume = self.resume.clone();
        let cancel = self.cancel_check.clone();
        let snapshots = self.snapshot_tx.clone();
        let st = storage.clone();
        let check_hashes = config.check_hashes;
        let check: StartupCheck = self
            .ctx
            .disk
            .run(move || {
                let mut report = |fraction: f64| {
                    snapshots.send_modify(|s| s.hashcheck_progress = fraction);
                };
                Ok(startup_check(&st, resume.as_ref(), check_hashes, &cancel, &mut report))
            })
            .await?;
        if self.cancel_check.load(Ordering::SeqCst) {
            return Err(TorrentError::io_error("Hash check cancelled").into());
        }

        let mut picker = PiecePicker::new(&info, config.rarest_first_cutoff);
        picker.set_file_priorities(&info, &priorities);
        picker.restore(&check.have, &check.partial);

        let (writer, writer_task) = DiskWriter::spawn(storage.clone(), self.ctx.disk.clone(), self.disk_tx.clone());
        for piece in picker.complete_unverified() {
            writer.submit(DiskJob::Verify {
                piece,
                checks: config.verify_checks(),
            })?;
        }

        let conn_config = Arc::new(config.connection_config(info.info_hash, self.ctx.peer_id, self.ctx.listen_port));
        let mut engine = Engine {
            storage,
            writer,
            writer_task,
            disk: self.ctx.disk.clone(),
            picker,
            pool: PeerPool::new(config.pool_limits(), config.exclude_ips.iter().copied()),
            peers: HashMap::new(),
            choker: Choker::new(config.max_uploads, config.min_uploads),
            super_seeder: None,
            tracker: None,
            announce_stats: None,
            write_buffer: WriteBuffer::new(config.write_buffer_size),
            read_cache: ReadCache::new(config.read_cache_size),
            conn_config,
            down_meter: RateMeter::default(),
            up_meter: RateMeter::default(),
            base_backlog: config.request_backlog,
            verify_checks: config.verify_checks(),
            last_writer: HashMap::new(),
            vod: None,
            last_rechoke: Instant::now(),
            last_flush: Instant::now(),
            last_dht: None,
            alloc_cursor: 0,
            alloc_inflight: false,
        };

        if let Some(vod_config) = config.vod().cloned() {
            let first = info.file_window(vod_config.file_index).map_or(0, |w| w.first_piece);
            engine.picker.set_mode(PickMode::Sequential { head: first });
            let tail = vod::tail_pieces(&info, &vod_config);
            engine.vod = Some(VodRuntime {
                config: vod_config,
                window: Vec::new(),
                tail,
                playback: VodPlayback::new(),
                stats: VodStats::default(),
            });
            engine.set_vod_head(&info, 0);
        }
        Ok(engine)
    }

    /// Install a freshly built engine and contact the swarm
    fn run_engine(&mut self, mut engine: Engine) {
        let complete = engine.picker.is_complete();
        self.status = if complete {
            DownloadStatus::Seeding
        } else {
            DownloadStatus::Downloading
        };
        if complete {
            self.seeding_since = Some(Instant::now());
            if self.config.super_seeder {
                engine.super_seeder = Some(SuperSeeder::new());
            }
        }
        self.have_tx.send_replace(engine.picker.have().clone());

        let stats = AnnounceStats {
            uploaded: self.stats.total_up,
            downloaded: self.stats.total_down,
            left: engine.picker.wanted_bytes_left(),
            seeding: complete,
        };
        let tiers = self.info.tracker_tiers();
        if let (Some(announcer), false) = (self.ctx.announcer.clone(), tiers.is_empty()) {
            let client = TrackerClient::new(tiers, announcer);
            let identity = AnnounceIdentity {
                info_hash: self.info.info_hash,
                peer_id: self.ctx.peer_id,
                port: self.ctx.listen_port,
                numwant: self.config.numwant,
                ip: self.ctx.tracker_ip.clone(),
                stop_timeout: self.config.http_timeout(),
            };
            let (stats_tx, stats_rx) = watch::channel(stats);
            engine.tracker = Some(spawn_tracker(client, identity, stats_rx, self.tracker_tx.clone()));
            engine.announce_stats = Some(stats_tx);
        }

        if let (Some(dht), false) = (self.ctx.dht.clone(), self.info.private) {
            self.spawn_dht_lookup(dht, true);
            engine.last_dht = Some(Instant::now());
        }

        info!(
            "Download {} running: {:?}, {}/{} pieces",
            self.hex(),
            self.status,
            engine.picker.have().count_ones(),
            engine.picker.piece_count()
        );
        self.engine = Some(engine);
        self.refresh_progress();
        self.connect_more();
    }

    fn spawn_dht_lookup(&self, dht: Arc<Dht>, bootstrap: bool) {
        let contacts = self.info.nodes.clone();
        let found = self.found_tx.clone();
        let info_hash = self.info.info_hash;
        let port = self.ctx.listen_port;
        tokio::spawn(async move {
            if bootstrap && !contacts.is_empty() {
                let resolved = resolve_contacts(&contacts).await;
                dht.bootstrap(resolved).await;
            }
            let peers = dht.get_peers(info_hash, Some(port)).await;
            debug!("DHT lookup for {} found {} peers", hex::encode(info_hash), peers.len());
            let _ = found.send(peers);
        });
    }

    /// Close peers, announce `stopped`, flush storage and capture resume data
    async fn stop_engine(&mut self) {
        let Some(mut engine) = self.engine.take() else {
            return;
        };
        if let Some(since) = self.seeding_since.take() {
            self.stats.time_seeding += since.elapsed().as_secs();
        }
        if let Some(tracker) = engine.tracker.take() {
            tracker.stop().await;
        }
        for (_, session) in engine.peers.drain() {
            session.conn.close();
        }
        engine.pool.clear();

        if let Err(e) = engine.flush_buffer() {
            warn!("Could not flush buffered blocks of {}: {:#}", self.hex(), e);
        }
        if let Err(e) = engine.writer.flush().await {
            warn!("Could not sync {}: {:#}", self.hex(), e);
        }
        match self.capture_resume(&engine).await {
            Ok(resume) => self.resume = Some(resume),
            Err(e) => warn!("Could not capture resume data for {}: {:#}", self.hex(), e),
        }

        let Engine { writer, writer_task, .. } = engine;
        drop(writer);
        let _ = writer_task.await;
        self.have_tx.send_replace(Bitfield::new(self.info.piece_count()));
        info!("Download {} stopped", self.hex());
    }

    async fn capture_resume(&self, engine: &Engine) -> Result<EngineResumeData> {
        let storage = engine.storage.clone();
        let have = engine.picker.have().clone();
        let partial = engine.picker.partial_pieces();
        self.ctx
            .disk
            .run(move || Ok(EngineResumeData::capture(&storage, &have, partial)))
            .await
    }

    async fn stop(&mut self, remove_state: bool, remove_content: bool) -> Result<()> {
        self.stop_engine().await;
        if self.status != DownloadStatus::StoppedOnError {
            self.status = DownloadStatus::Stopped;
        }

        if remove_content {
            let storage = match self.storage.take() {
                Some(storage) => storage,
                None => {
                    let (info, dest) = (self.info.clone(), self.config.dest_dir.clone());
                    let wanted = self.config.wanted_files(info.files.len());
                    let (alloc, locking) = (AllocPolicy::Normal, self.config.locking_policy);
                    Arc::new(
                        self.ctx
                            .disk
                            .run(move || FileStorage::open(dest, info, wanted, alloc, locking))
                            .await?,
                    )
                }
            };
            self.ctx.disk.run(move || storage.remove_content()).await?;
            self.resume = None;
            self.progress = 0.0;
            info!("Removed content of {}", self.hex());
        }

        if remove_state {
            let path = PState::path_in(&self.ctx.state_dir, &self.hex());
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Removed checkpoint {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(
                        TorrentError::io_error_full("Failed to remove checkpoint", path.display().to_string(), e.to_string())
                            .into(),
                    )
                }
            }
            Ok(())
        } else {
            self.checkpoint().await.map(|_| ())
        }
    }

    async fn shutdown(&mut self, checkpoint: bool) {
        self.cancel_check.store(true, Ordering::SeqCst);
        let status = self.status;
        self.stop_engine().await;
        // The checkpoint keeps the status the download had when the session went down
        self.status = status;
        if checkpoint {
            if let Err(e) = self.checkpoint().await {
                warn!("Final checkpoint of {} failed: {:#}", self.hex(), e);
            }
        }
        self.publish();
    }

    async fn fail(&mut self, err: TorrentError) {
        error!("Download {} stopped on error: {}", self.hex(), err);
        self.stop_engine().await;
        self.status = DownloadStatus::StoppedOnError;
        self.error = Some(ErrorInfo::from(&err));
        if let Err(e) = self.checkpoint().await {
            warn!("Checkpoint after failure of {} failed: {:#}", self.hex(), e);
        }
        self.publish();
    }

    /// Flush storage, capture resume data and write the state file
    async fn checkpoint(&mut self) -> Result<PState> {
        if let Some(engine) = self.engine.as_mut() {
            engine.flush_buffer()?;
            engine.writer.flush().await?;
        }
        if let Some(engine) = self.engine.as_ref() {
            self.resume = Some(self.capture_resume(engine).await?);
        }
        let status = match self.status {
            DownloadStatus::Hashchecking => DownloadStatus::Downloading,
            other => other,
        };
        let mut state = PState::new(&self.info, self.config.clone(), status, self.progress);
        state.error = self.error.clone();
        state.seeding = self.seeding_stats();
        state.set_engine_resume(self.resume.as_ref());

        let path = PState::path_in(&self.ctx.state_dir, &self.hex());
        let saved = state.clone();
        self.ctx.disk.run(move || saved.save(&path)).await?;
        self.last_checkpoint = Instant::now();
        Ok(state)
    }

    async fn set_selected_files(&mut self, files: Vec<usize>) -> Result<SetOutcome> {
        let mut config = self.config.clone();
        config.selected_files = files;
        config.validate_files(self.info.files.len())?;
        self.config = config;
        self.apply_file_priorities().await?;
        Ok(SetOutcome::Applied)
    }

    async fn set_file_priorities(&mut self, priorities: Vec<PiecePriority>) -> Result<SetOutcome> {
        let mut config = self.config.clone();
        config.file_priorities = priorities;
        config.validate_files(self.info.files.len())?;
        self.config = config;
        self.apply_file_priorities().await?;
        Ok(SetOutcome::Applied)
    }

    /// Push the configured file priorities into a running engine
    async fn apply_file_priorities(&mut self) -> Result<()> {
        let priorities = self.config.effective_priorities(self.info.files.len());
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };
        // Buffered blocks must land before files move
        engine.flush_buffer()?;
        engine.writer.flush().await?;
        let storage = engine.storage.clone();
        let wanted: Vec<bool> = priorities.iter().map(|p| p.is_wanted()).collect();
        self.ctx
            .disk
            .run(move || {
                for (idx, wanted) in wanted.into_iter().enumerate() {
                    storage.set_file_wanted(idx, wanted)?;
                }
                Ok(())
            })
            .await?;

        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };
        engine.picker.set_file_priorities(&self.info, &priorities);
        engine.restore_vod_priority();
        for addr in engine.ready_peers() {
            engine.update_interest(addr);
        }
        engine.fill_all();
        let complete = engine.picker.is_complete();
        self.refresh_progress();
        info!(
            "File priorities of {} set to {:?}, progress {:.1}%",
            self.hex(),
            priorities,
            self.progress * 100.0
        );

        match (complete, self.status) {
            (true, DownloadStatus::Downloading) => self.on_complete().await,
            (false, DownloadStatus::Seeding) => {
                info!("Download {} has new wanted pieces, downloading again", self.hex());
                self.status = DownloadStatus::Downloading;
                if let Some(since) = self.seeding_since.take() {
                    self.stats.time_seeding += since.elapsed().as_secs();
                }
                let stats = self.announce_stats();
                if let Some(engine) = self.engine.as_mut() {
                    engine.super_seeder = None;
                    if let Some(tx) = &engine.announce_stats {
                        tx.send_replace(stats);
                    }
                }
                self.connect_more();
            }
            _ => {}
        }
        Ok(())
    }

    fn open_stream(&mut self) -> Result<VodStream> {
        let Some(vod_config) = self.config.vod().cloned() else {
            return Err(TorrentError::not_enabled("streaming requires VOD mode").into());
        };
        let Some(engine) = self.engine.as_ref() else {
            return Err(TorrentError::not_possible_at_runtime("open_stream on a stopped download").into());
        };
        VodStream::new(
            engine.storage.clone(),
            self.ctx.disk.clone(),
            vod_config.file_index,
            self.have_tx.subscribe(),
            self.head_tx.clone(),
        )
    }

    async fn apply_rates(&self) {
        for (dir, desired, allocated) in [
            (Direction::Up, self.config.max_upload_rate, self.allocation.up),
            (Direction::Down, self.config.max_download_rate, self.allocation.down),
        ] {
            let rate = if desired > 0 { desired } else { allocated };
            self.download_buckets.set_rate(dir, rate).await;
            trace!("{} {:?} rate set to {}", self.hex(), dir, rate);
        }
    }

    // ---- peers ----

    fn add_peers(&mut self, addrs: Vec<SocketAddr>, source: PeerSource) {
        if let Some(engine) = self.engine.as_mut() {
            engine.pool.add_many(addrs, source);
        }
        self.connect_more();
    }

    fn connect_more(&mut self) {
        if !matches!(self.status, DownloadStatus::Downloading | DownloadStatus::Seeding) {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        for entry in engine.pool.next_to_connect() {
            let addr = entry.addr;
            trace!("Connecting to {} ({:?})", addr, entry.source);
            let limiter = limiter_for(&self.config, &self.ctx, &self.download_buckets, addr);
            let conn = PeerConnection::connect(addr, engine.conn_config.clone(), limiter, self.peer_tx.clone());
            engine.peers.insert(addr, PeerSession::new(conn, entry, false));
        }
    }

    fn on_incoming(&mut self, stream: TcpStream, addr: SocketAddr, handshake: Handshake) {
        let Some(engine) = self.engine.as_mut() else {
            debug!("Rejecting {} for {}: download not running", addr, self.info.info_hash_hex());
            return;
        };
        if let Err(e) = engine.pool.admit_incoming(addr) {
            debug!("Rejecting incoming {}: {:#}", addr, e);
            return;
        }
        let limiter = limiter_for(&self.config, &self.ctx, &self.download_buckets, addr);
        let conn = PeerConnection::accept(
            stream,
            addr,
            handshake,
            engine.conn_config.clone(),
            limiter,
            self.peer_tx.clone(),
        );
        engine.pool.mark_connected(addr, true);
        engine
            .peers
            .insert(addr, PeerSession::new(conn, PeerEntry::new(addr, PeerSource::Incoming), true));
        debug!("Accepted incoming peer {} for {}", addr, self.info.info_hash_hex());
    }

    /// Close a misbehaving peer and count the violation against its IP
    fn drop_peer(&mut self, addr: SocketAddr, err: TorrentError) {
        warn!("Dropping {}: {}", addr, err);
        self.record_log(&err, addr);
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if err.kind() == ErrorKind::ProtocolViolation && engine.pool.record_violation(addr.ip()) {
            info!("{} banned after repeated protocol violations", addr.ip());
        }
        if let Some(session) = engine.detach(addr, false) {
            session.conn.abort();
        }
        engine.fill_all();
    }

    fn record_log(&self, err: &TorrentError, addr: SocketAddr) {
        if let Ok(mut ring) = self.log.lock() {
            ring.record(err, Some(addr.to_string()));
        }
    }

    fn on_peer_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(session) = engine.peers.get_mut(&addr) else {
            trace!("Event from unknown peer {}", addr);
            return;
        };
        match event {
            PeerEvent::Ready { peer_id, extensions } => self.on_peer_ready(addr, peer_id, extensions),
            PeerEvent::Message(message) => self.on_peer_message(addr, message),
            PeerEvent::Block { piece, offset, data } => self.on_block(addr, piece, offset, data),
            PeerEvent::ExtensionHandshake(hs) => {
                session.reqq = hs.reqq.and_then(|r| u32::try_from(r).ok());
                debug!(
                    "{} extension handshake: client {:?}, ut_pex {:?}",
                    addr,
                    hs.v,
                    hs.id_for(UT_PEX)
                );
            }
            PeerEvent::Pex(pex) => {
                if !self.info.private {
                    engine.pool.add_many(pex.added, PeerSource::Pex);
                    self.connect_more();
                }
            }
            PeerEvent::Received { wire_bytes } => {
                session.down.record(wire_bytes as u64);
                engine.down_meter.record(wire_bytes as u64);
            }
            PeerEvent::Closed { error } => self.on_peer_closed(addr, error),
        }
    }

    fn on_peer_ready(&mut self, addr: SocketAddr, peer_id: [u8; 20], extensions: bool) {
        let seeding = self.status == DownloadStatus::Seeding;
        let breakup = self.config.breakup_seed_bitfield;
        let local_ip = self.ctx.local_ip;
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(session) = engine.peers.get_mut(&addr) else {
            return;
        };
        session.ready = true;
        session.entry.peer_id = Some(peer_id);
        session.entry.flags.supports_extension_protocol = extensions;
        session.entry.flags.local = is_local_peer(&addr, local_ip);
        engine.pool.mark_connected(addr, session.incoming);
        engine.picker.add_peer(addr);

        match engine.super_seeder.as_mut().filter(|_| seeding) {
            Some(ss) => {
                let nothing = Bitfield::new(engine.picker.piece_count());
                if let Some(piece_index) = ss.next_offer(addr, &nothing) {
                    session.conn.send(Message::Have { piece_index });
                }
            }
            None => {
                for message in initial_announcement(engine.picker.have(), breakup) {
                    session.conn.send(message);
                }
            }
        }
        if extensions {
            match extension_handshake(&engine.conn_config) {
                Ok(message) => {
                    session.conn.send(message);
                }
                Err(e) => warn!("Could not encode extension handshake for {}: {:#}", addr, e),
            }
        }
        info!("Peer {} ready for {} ({})", addr, self.info.info_hash_hex(), Handshake::client_name(&peer_id));
    }

    fn on_peer_message(&mut self, addr: SocketAddr, message: Message) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(session) = engine.peers.get_mut(&addr) else {
            return;
        };
        match message {
            Message::Choke => {
                session.choke.peer_choking = true;
                let released = engine.picker.release_requests(&addr);
                trace!("{} choked us, {} requests released", addr, released.len());
                engine.fill_all();
            }
            Message::Unchoke => {
                session.choke.peer_choking = false;
                engine.fill_requests(addr);
            }
            Message::Interested => {
                session.choke.peer_interested = true;
                let unchoked = engine.peers.values().filter(|s| !s.choke.am_choking).count();
                if unchoked < self.config.max_uploads + self.config.min_uploads {
                    self.rechoke();
                }
            }
            Message::NotInterested => session.choke.peer_interested = false,
            Message::Have { piece_index } => {
                if let Err(e) = engine.picker.on_have(addr, piece_index) {
                    let err = TorrentError::from_anyhow(e, TorrentError::protocol_violation);
                    self.drop_peer(addr, err);
                    return;
                }
                self.after_availability(addr);
                let Some(engine) = self.engine.as_mut() else {
                    return;
                };
                let next = match engine.super_seeder.as_mut() {
                    Some(ss) => {
                        if ss.on_have(&addr, piece_index) {
                            let bits = engine.picker.peer_bitfield(&addr).cloned();
                            bits.and_then(|bits| ss.next_offer(addr, &bits))
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                if let (Some(piece_index), Some(session)) = (next, engine.peers.get(&addr)) {
                    session.conn.send(Message::Have { piece_index });
                }
            }
            Message::Bitfield { bitfield } => {
                if let Err(e) = engine.picker.on_bitfield(addr, &bitfield) {
                    let err = TorrentError::from_anyhow(e, TorrentError::protocol_violation);
                    self.drop_peer(addr, err);
                    return;
                }
                self.after_availability(addr);
            }
            Message::Request { index, begin, length } => {
                if session.choke.am_choking {
                    trace!("Ignoring request from choked peer {}", addr);
                    return;
                }
                if !engine.picker.has(index) {
                    debug!("{} requested piece {} which we lack", addr, index);
                    return;
                }
                session.uploads.push_back(BlockRequest {
                    piece: index,
                    offset: begin,
                    length,
                });
                self.pump_uploads(addr);
            }
            Message::Cancel { index, begin, length } => {
                let cancelled = BlockRequest {
                    piece: index,
                    offset: begin,
                    length,
                };
                session.uploads.retain(|r| *r != cancelled);
            }
            Message::Port { listen_port } => {
                if let Some(dht) = self.ctx.dht.clone() {
                    let node = SocketAddr::new(addr.ip(), listen_port);
                    tokio::spawn(async move {
                        let _ = dht.query(node, Query::Ping).await;
                    });
                }
            }
            other => trace!("Unhandled message from {}: {:?}", addr, other),
        }
    }

    /// Refresh seed flag, interest and requests after a HAVE or bitfield
    fn after_availability(&mut self, addr: SocketAddr) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let is_seed = engine.picker.peer_bitfield(&addr).is_some_and(Bitfield::all);
        if let Some(session) = engine.peers.get_mut(&addr) {
            session.entry.flags.seed = is_seed;
        }
        if is_seed && self.status == DownloadStatus::Seeding {
            debug!("Closing {}: both sides are seeds", addr);
            if let Some(session) = engine.detach(addr, false) {
                session.conn.close();
            }
            return;
        }
        engine.update_interest(addr);
        engine.fill_requests(addr);
    }

    fn on_block(&mut self, addr: SocketAddr, piece: u32, offset: u32, data: Vec<u8>) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let length = data.len() as u32;
        match engine.picker.on_block_received(piece, offset, length, &addr) {
            BlockOutcome::Unexpected => {
                let err = TorrentError::protocol_violation_with_peer(
                    format!("Block {}+{} ({} bytes) does not exist", piece, offset, length),
                    addr.to_string(),
                );
                self.drop_peer(addr, err);
            }
            BlockOutcome::Duplicate => trace!("Duplicate block {}+{} from {}", piece, offset, addr),
            BlockOutcome::New { cancels, piece_complete } => {
                self.stats.total_down += length as u64;
                if let Some(session) = engine.peers.get_mut(&addr) {
                    session.last_block = Instant::now();
                    session.entry.flags.snubbed = false;
                }
                engine.last_writer.insert(piece, addr);
                for (peer, req) in cancels {
                    if let Some(other) = engine.peers.get(&peer) {
                        other.conn.send(Message::Cancel {
                            index: req.piece,
                            begin: req.offset,
                            length: req.length,
                        });
                    }
                }

                let over = engine.write_buffer.push(piece, offset, data);
                let submitted = if piece_complete {
                    let mut result = Ok(());
                    for write in engine.write_buffer.take_piece(piece) {
                        result = result.and_then(|_| {
                            engine.writer.submit(DiskJob::Write {
                                piece,
                                offset: write.offset,
                                data: write.data,
                            })
                        });
                    }
                    result.and_then(|_| {
                        engine.writer.submit(DiskJob::Verify {
                            piece,
                            checks: engine.verify_checks,
                        })
                    })
                } else if over {
                    engine.flush_buffer()
                } else {
                    Ok(())
                };
                if let Err(e) = submitted {
                    error!("Disk writer for {} unavailable: {:#}", self.info.info_hash_hex(), e);
                }
                engine.fill_requests(addr);
            }
        }
    }

    fn on_peer_closed(&mut self, addr: SocketAddr, error: Option<TorrentError>) {
        let downloading = self.status == DownloadStatus::Downloading;
        let violation = error.as_ref().is_some_and(|e| e.kind() == ErrorKind::ProtocolViolation);
        if let Some(err) = &error {
            if violation {
                warn!("Peer {} violated the protocol: {}", addr, err);
                self.record_log(err, addr);
            } else {
                debug!("Peer {} disconnected: {}", addr, err);
            }
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if violation && engine.pool.record_violation(addr.ip()) {
            info!("{} banned after repeated protocol violations", addr.ip());
        }
        let was_ready = engine.peers.get(&addr).is_some_and(|s| s.ready);
        engine.detach(addr, was_ready && !violation && downloading);
        engine.fill_all();
        self.connect_more();
    }

    // ---- uploads ----

    fn pump_uploads(&mut self, addr: SocketAddr) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        loop {
            let Some(session) = engine.peers.get_mut(&addr) else {
                return;
            };
            if session.choke.am_choking {
                session.uploads.clear();
                return;
            }
            if session.reading || session.conn.is_saturated() {
                return;
            }
            let Some(req) = session.uploads.front().copied() else {
                return;
            };
            if let Some(block) = engine.read_cache.get(req.piece, req.offset, req.length) {
                session.uploads.pop_front();
                let sent = block.len() as u64;
                session.conn.send(Message::Piece {
                    index: req.piece,
                    begin: req.offset,
                    block,
                });
                session.up.record(sent);
                engine.up_meter.record(sent);
                self.stats.total_up += sent;
                continue;
            }

            session.reading = true;
            let storage = engine.storage.clone();
            let pool = engine.disk.clone();
            let tx = self.upload_tx.clone();
            let piece = req.piece;
            tokio::spawn(async move {
                let data = pool
                    .run(move || {
                        let size = storage.torrent_info().piece_size(piece);
                        storage.read(piece, 0, size as u32)
                    })
                    .await
                    .map(Arc::new);
                let _ = tx.send(UploadRead { addr, piece, data });
            });
            return;
        }
    }

    fn on_upload_read(&mut self, read: UploadRead) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(session) = engine.peers.get_mut(&read.addr) else {
            return;
        };
        session.reading = false;
        match read.data {
            Ok(data) => {
                engine.read_cache.insert(read.piece, data.clone());
                while let Some(req) = session.uploads.front().copied() {
                    if req.piece != read.piece || session.conn.is_saturated() {
                        break;
                    }
                    session.uploads.pop_front();
                    let start = req.offset as usize;
                    let Some(block) = data.get(start..start + req.length as usize) else {
                        debug!("{} requested {:?} beyond the piece end", read.addr, req);
                        continue;
                    };
                    session.conn.send(Message::Piece {
                        index: req.piece,
                        begin: req.offset,
                        block: block.to_vec(),
                    });
                    session.up.record(req.length as u64);
                    engine.up_meter.record(req.length as u64);
                    self.stats.total_up += req.length as u64;
                }
            }
            Err(e) => {
                warn!("Read of piece {} for upload failed: {:#}", read.piece, e);
                session.uploads.retain(|r| r.piece != read.piece);
            }
        }
        self.pump_uploads(read.addr);
    }

    fn rechoke(&mut self) {
        let seeding = self.status == DownloadStatus::Seeding;
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let candidates: Vec<ChokeCandidate> = engine
            .peers
            .iter_mut()
            .filter(|(_, s)| s.ready)
            .map(|(addr, s)| ChokeCandidate {
                peer: *addr,
                interested: s.choke.peer_interested,
                snubbed: s.entry.flags.snubbed,
                down_rate: s.down.rate(),
                up_rate: s.up.rate(),
            })
            .collect();
        let unchoked = engine.choker.rechoke(&candidates, seeding);
        for (addr, session) in engine.peers.iter_mut().filter(|(_, s)| s.ready) {
            let unchoke = unchoked.contains(addr);
            if unchoke && session.choke.am_choking {
                session.choke.am_choking = false;
                session.conn.send(Message::Unchoke);
            } else if !unchoke && !session.choke.am_choking {
                session.choke.am_choking = true;
                session.uploads.clear();
                session.conn.send(Message::Choke);
            }
        }
        engine.last_rechoke = Instant::now();
    }

    // ---- disk ----

    async fn on_disk_event(&mut self, event: DiskEvent) {
        match event {
            DiskEvent::PieceChecked { piece, ok: true } => self.on_piece_verified(piece).await,
            DiskEvent::PieceChecked { piece, ok: false } => self.on_piece_failed(piece),
            DiskEvent::WriteFailed { piece, error } => {
                error!("Write of piece {} failed: {}", piece, error);
                if self.engine.is_some() {
                    self.fail(error).await;
                }
            }
            DiskEvent::Extended { file, len } => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.alloc_inflight = false;
                    if self.info.files.get(file).map_or(true, |f| len >= f.length) {
                        engine.alloc_cursor = file + 1;
                    }
                }
            }
        }
    }

    async fn on_piece_verified(&mut self, piece: u32) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.picker.has(piece) {
            return;
        }
        engine.picker.on_piece_verified(piece);
        engine.last_writer.remove(&piece);
        self.have_tx.send_replace(engine.picker.have().clone());
        trace!("Piece {} of {} verified", piece, self.info.info_hash_hex());

        for addr in engine.ready_peers() {
            if let Some(session) = engine.peers.get(&addr) {
                session.conn.send(Message::Have { piece_index: piece });
            }
            engine.update_interest(addr);
        }
        let complete = engine.picker.is_complete();
        self.refresh_progress();
        if complete && self.status == DownloadStatus::Downloading {
            self.on_complete().await;
        }
    }

    fn on_piece_failed(&mut self, piece: u32) {
        let auto_kick = self.config.auto_kick;
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        engine.picker.on_piece_failed(piece);
        engine.read_cache.invalidate(piece);
        let culprit = engine.last_writer.remove(&piece);
        let err = match culprit {
            Some(addr) => TorrentError::hash_mismatch_from(piece, addr.to_string()),
            None => TorrentError::hash_mismatch(piece),
        };
        warn!("{}", err);
        if let Ok(mut ring) = self.log.lock() {
            ring.record(&err, culprit.map(|a| a.to_string()));
        }
        if let (true, Some(addr)) = (auto_kick, culprit) {
            engine.pool.ban(addr.ip());
            if let Some(session) = engine.detach(addr, false) {
                session.conn.abort();
            }
        }
        engine.fill_all();
    }

    async fn on_complete(&mut self) {
        info!("Download {} complete, seeding", self.info.info_hash_hex());
        self.status = DownloadStatus::Seeding;
        self.seeding_since = Some(Instant::now());
        let stats = self.announce_stats();
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if let Some(tx) = &engine.announce_stats {
            tx.send_replace(stats);
        }
        if self.config.super_seeder {
            engine.super_seeder = Some(SuperSeeder::new());
        }
        let seeds: Vec<SocketAddr> = engine
            .peers
            .iter()
            .filter(|(_, s)| s.entry.flags.seed)
            .map(|(a, _)| *a)
            .collect();
        for addr in seeds {
            if let Some(session) = engine.detach(addr, false) {
                session.conn.close();
            }
        }

        let storage = engine.storage.clone();
        let pool = engine.disk.clone();
        tokio::spawn(async move {
            match pool.run(move || Ok(storage.verify_file_hashes())).await {
                Ok(failed) if failed.is_empty() => {}
                Ok(failed) => warn!("End-to-end hash mismatch in files {:?}", failed),
                Err(e) => warn!("End-to-end hash check failed: {:#}", e),
            }
        });
        if let Err(e) = self.checkpoint().await {
            warn!("Checkpoint at completion failed: {:#}", e);
        }
    }

    // ---- tracker ----

    fn on_tracker_update(&mut self, update: TrackerUpdate) {
        match update.error {
            Some(err) => {
                warn!("Announce for {} failed: {}", self.info.info_hash_hex(), err);
                if self.status != DownloadStatus::StoppedOnError {
                    self.error = Some(ErrorInfo::from(&err));
                }
            }
            None => {
                debug!("Tracker returned {} peers for {}", update.peers.len(), self.info.info_hash_hex());
                if self
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind == ErrorKind::TrackerUnreachable)
                {
                    self.error = None;
                }
            }
        }
        self.tracker_status = Some(update.status);
        self.add_peers(update.peers, PeerSource::Tracker);
    }

    fn announce_stats(&self) -> AnnounceStats {
        AnnounceStats {
            uploaded: self.stats.total_up,
            downloaded: self.stats.total_down,
            left: self.engine.as_ref().map_or(0, |e| e.picker.wanted_bytes_left()),
            seeding: self.status == DownloadStatus::Seeding,
        }
    }

    // ---- periodic work ----

    async fn on_tick(&mut self) {
        if self.engine.is_none() {
            return;
        }
        self.connect_more();
        self.check_snubbed();

        let due_rechoke = self
            .engine
            .as_ref()
            .is_some_and(|e| e.last_rechoke.elapsed() >= self.config.round_robin_period());
        if due_rechoke {
            self.rechoke();
        }

        let addrs = self.engine.as_ref().map(Engine::ready_peers).unwrap_or_default();
        if let Some(engine) = self.engine.as_mut() {
            for session in engine.peers.values_mut() {
                if session.conn.is_saturated() {
                    session.conn.grow_watermark();
                }
            }
        }
        for addr in addrs {
            self.pump_uploads(addr);
        }

        if let Some(engine) = self.engine.as_mut() {
            if engine.last_flush.elapsed() >= WRITE_FLUSH_INTERVAL {
                if let Err(e) = engine.flush_buffer() {
                    warn!("Periodic flush failed: {:#}", e);
                }
            }
        }
        self.background_allocation();

        let dht_due = self
            .engine
            .as_ref()
            .and_then(|e| e.last_dht)
            .is_some_and(|at| at.elapsed() >= DHT_LOOKUP_INTERVAL);
        if let (true, Some(dht)) = (dht_due, self.ctx.dht.clone()) {
            self.spawn_dht_lookup(dht, false);
            if let Some(engine) = self.engine.as_mut() {
                engine.last_dht = Some(Instant::now());
            }
        }

        self.refresh_progress();
        self.update_vod();
        let stats = self.announce_stats();
        if let Some(tx) = self.engine.as_ref().and_then(|e| e.announce_stats.as_ref()) {
            // Only a seeding change needs to wake the announce task
            tx.send_if_modified(|current| {
                let wake = current.seeding != stats.seeding;
                *current = stats;
                wake
            });
        }

        if self.last_checkpoint.elapsed() >= self.ctx.checkpoint_interval {
            if let Err(e) = self.checkpoint().await {
                warn!("Periodic checkpoint of {} failed: {:#}", self.info.info_hash_hex(), e);
            }
        }
        self.publish();
    }

    fn check_snubbed(&mut self) {
        let snub_time = self.config.snub_time();
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let mut snubbed = Vec::new();
        for (addr, session) in engine.peers.iter_mut() {
            if session.ready
                && !session.entry.flags.snubbed
                && engine.picker.pending_requests(addr) > 0
                && session.last_block.elapsed() > snub_time
            {
                session.entry.flags.snubbed = true;
                snubbed.push(*addr);
            }
        }
        for addr in snubbed {
            let released = engine.picker.release_requests(&addr);
            debug!("Peer {} snubbed, cancelling {} requests", addr, released.len());
            if let Some(session) = engine.peers.get(&addr) {
                for req in released {
                    session.conn.send(Message::Cancel {
                        index: req.piece,
                        begin: req.offset,
                        length: req.length,
                    });
                }
            }
        }
        engine.fill_all();
    }

    fn background_allocation(&mut self) {
        if self.config.alloc_policy != AllocPolicy::Background {
            return;
        }
        let rate = self.config.alloc_rate.max(1);
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.alloc_inflight {
            return;
        }
        while let Some(file) = self.info.files.get(engine.alloc_cursor) {
            let current = engine.storage.allocated_len(engine.alloc_cursor);
            if current >= file.length {
                engine.alloc_cursor += 1;
                continue;
            }
            let job = DiskJob::Extend {
                file: engine.alloc_cursor,
                target: current.saturating_add(rate),
            };
            engine.alloc_inflight = engine.writer.submit(job).is_ok();
            return;
        }
    }

    fn update_vod(&mut self) {
        let progress = self.progress;
        let info = self.info.clone();
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let down_rate = engine.down_meter.rate();
        let storage = engine.storage.clone();
        let Some(rt) = engine.vod.as_mut() else {
            return;
        };
        rt.stats = vod::vod_stats(&info, engine.picker.have(), &rt.window, down_rate, progress);
        let file = rt.config.file_index;
        if let Some(event) = rt
            .playback
            .update(&rt.stats, || vod::start_event(&info, file, storage.path_of(file)))
        {
            let _ = self.vod_tx.send(event);
        }
    }

    // ---- state ----

    fn refresh_progress(&mut self) {
        if let Some(engine) = &self.engine {
            let wanted = engine.picker.wanted_bytes();
            let left = engine.picker.wanted_bytes_left();
            self.progress = if wanted == 0 {
                1.0
            } else {
                (wanted - left) as f64 / wanted as f64
            };
        }
    }

    fn seeding_stats(&self) -> SeedingStats {
        let mut stats = self.stats;
        if let Some(since) = self.seeding_since {
            stats.time_seeding += since.elapsed().as_secs();
        }
        stats.update_ratio(self.info.total_size());
        stats
    }

    fn snapshot(&mut self, with_peers: bool) -> StateSnapshot {
        let mut snapshot = StateSnapshot {
            info_hash: self.info.info_hash_hex(),
            name: self.info.name.clone(),
            status: self.status,
            progress: self.progress,
            hashcheck_progress: if self.engine.is_some() { 1.0 } else { 0.0 },
            error: self.error.clone(),
            seeding: self.seeding_stats(),
            tracker: self.tracker_status.clone(),
            ..StateSnapshot::default()
        };
        if let Some(engine) = self.engine.as_mut() {
            snapshot.down_rate = engine.down_meter.rate();
            snapshot.up_rate = engine.up_meter.rate();
            snapshot.peer_count = engine.peers.values().filter(|s| s.ready).count();
            snapshot.availability = engine.picker.availability_summary();
            snapshot.vod = engine.vod.as_ref().map(|v| v.stats);
            if with_peers {
                snapshot.peers = Some(engine.peer_snapshots());
            }
        }
        snapshot
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot(false);
        self.snapshot_tx.send_replace(snapshot);
    }
}
