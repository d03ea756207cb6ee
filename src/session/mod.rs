//! Session module
//!
//! The supervisor of every download in a process. A session binds one TCP and
//! one UDP socket on the same port, owns the disk worker pool, the global rate
//! buckets, the DHT node and the tracker transports, restores checkpoints from
//! `state_dir/downloads` at start and writes them again on shutdown. Accepted
//! peer connections are dispatched to downloads by the handshake's info hash.

pub mod config;
pub mod udp;

pub use config::{RuntimeConfig, SessionConfig, UpnpMode, CONFIG_FILE, DOWNLOADS_DIR, ITRACKER_DIR};
pub use udp::UdpMux;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dht::{resolve_contacts, Dht};
use crate::download::{
    spawn_download, write_atomic, DownloadConfig, DownloadHandle, DownloadStatus, EngineContext, PState, SetOutcome,
    STATE_EXTENSION,
};
use crate::error::{ErrorKind, TorrentError};
use crate::protocol::{BitTorrentWire, Handshake, WireProtocol};
use crate::ratelimit::{AllocationInput, BucketPair, Direction, RateAllocator};
use crate::storage::DiskPool;
use crate::torrent::{TorrentInfo, TorrentParser};
use crate::tracker::{Announcer, TransportAnnouncer};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ALLOCATE_INTERVAL: Duration = Duration::from_secs(1);
/// Suffix appended to checkpoints that cannot be restored
pub const CORRUPT_SUFFIX: &str = "corrupt";
const DESCRIPTOR_EXTENSION: &str = "torrent";

struct Registered {
    handle: DownloadHandle,
    task: JoinHandle<()>,
}

pub struct Session {
    config: SessionConfig,
    runtime: Mutex<RuntimeConfig>,
    peer_id: [u8; 20],
    listen_addr: SocketAddr,
    local_ip: Option<IpAddr>,
    disk: DiskPool,
    global: BucketPair,
    udp: Arc<UdpMux>,
    dht: Option<Arc<Dht>>,
    announcer: Option<Arc<dyn Announcer>>,
    downloads: Mutex<HashMap<[u8; 20], Registered>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state_dir", &self.config.state_dir)
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}

impl Session {
    /// Bind sockets, restore checkpoints and start serving
    pub async fn start(config: SessionConfig) -> Result<Arc<Self>> {
        Self::start_with_announcer(config, None).await
    }

    /// Like [`Session::start`], announcing through `announcer` instead of the HTTP/UDP transports
    pub async fn start_with_announcer(
        config: SessionConfig,
        announcer: Option<Arc<dyn Announcer>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let downloads_dir = config.downloads_dir();
        std::fs::create_dir_all(&downloads_dir).map_err(|e| {
            TorrentError::io_error_full("Failed to create state directory", downloads_dir.display().to_string(), e.to_string())
        })?;

        let bind_ip = config
            .bind_addresses
            .first()
            .copied()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let bind = SocketAddr::new(bind_ip, config.listen_port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to bind listen port", bind.to_string(), e.to_string()))?;
        let listen_addr = listener.local_addr()?;
        let udp = UdpMux::bind(listen_addr).await?;
        let mut tasks = vec![udp.spawn_reader()];

        let dht = if config.dht_enabled {
            let (dht, task) = Dht::start(udp.clone());
            tasks.push(task);
            let routers = config.dht_router_contacts();
            let node = dht.clone();
            tasks.push(tokio::spawn(async move {
                let contacts = resolve_contacts(&routers).await;
                node.bootstrap(contacts).await;
            }));
            Some(dht)
        } else {
            None
        };

        let announcer = match announcer {
            Some(announcer) => Some(announcer),
            None if config.tracker_enabled => Some(Arc::new(TransportAnnouncer::new(
                config.http_timeout(),
                Some(udp.clone()),
                config.udp_retry,
            )) as Arc<dyn Announcer>),
            None => None,
        };

        let session = Arc::new(Self {
            runtime: Mutex::new(RuntimeConfig::new(config.clone())),
            peer_id: Handshake::generate_peer_id(),
            listen_addr,
            local_ip: Some(bind_ip).filter(|ip| !ip.is_unspecified()),
            disk: DiskPool::new(config.disk_workers, config.disk_queue),
            global: BucketPair::new(config.max_upload_rate, config.max_download_rate, config.rate_period()),
            udp,
            dht,
            announcer,
            downloads: Mutex::new(HashMap::new()),
            acceptor: Mutex::new(None),
            tasks: Mutex::new(tasks),
            closing: AtomicBool::new(false),
            config,
        });
        session.config.save()?;
        session.spawn_acceptor(listener);
        session.spawn_allocator();
        let restored = session.restore_downloads().await?;
        info!(
            "Session listening on {} (peer id {}), {} downloads restored",
            listen_addr,
            hex::encode(session.peer_id),
            restored
        );
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current runtime values, deferred changes included
    pub fn runtime_config(&self) -> SessionConfig {
        match self.runtime.lock() {
            Ok(runtime) => runtime.get().clone(),
            Err(_) => self.config.clone(),
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_addr.port()
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn dht(&self) -> Option<&Arc<Dht>> {
        self.dht.as_ref()
    }

    pub fn udp(&self) -> &Arc<UdpMux> {
        &self.udp
    }

    fn push_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    fn engine_context(&self) -> EngineContext {
        let runtime = self.runtime_config();
        EngineContext {
            peer_id: self.peer_id,
            listen_port: self.listen_addr.port(),
            state_dir: self.config.downloads_dir(),
            disk: self.disk.clone(),
            global: self.global.clone(),
            announcer: self.announcer.clone(),
            dht: self.dht.clone(),
            tracker_ip: runtime.ip_for_tracker.clone(),
            local_ip: self.local_ip,
            checkpoint_interval: runtime.checkpoint_interval(),
        }
    }

    // ---- registry ----

    pub fn get(&self, info_hash: &[u8; 20]) -> Option<DownloadHandle> {
        let downloads = self.downloads.lock().ok()?;
        downloads.get(info_hash).map(|r| r.handle.clone())
    }

    /// Look a download up by a prefix of its hex info hash
    pub fn find(&self, id: &str) -> Option<DownloadHandle> {
        let id = id.to_ascii_lowercase();
        let matches: Vec<DownloadHandle> = self
            .downloads()
            .into_iter()
            .filter(|h| h.info_hash_hex().starts_with(&id))
            .collect();
        match matches.len() {
            1 => matches.into_iter().next(),
            _ => None,
        }
    }

    pub fn downloads(&self) -> Vec<DownloadHandle> {
        match self.downloads.lock() {
            Ok(downloads) => downloads.values().map(|r| r.handle.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn register(&self, handle: DownloadHandle, task: JoinHandle<()>) -> Result<DownloadHandle> {
        let mut downloads = self
            .downloads
            .lock()
            .map_err(|_| TorrentError::io_error("Download registry poisoned"))?;
        let info_hash = handle.info_hash();
        if downloads.contains_key(&info_hash) {
            task.abort();
            return Err(TorrentError::duplicate_download(&info_hash).into());
        }
        downloads.insert(
            info_hash,
            Registered {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    /// Start downloading `info` into `config.dest_dir`
    pub async fn add(&self, info: TorrentInfo, config: DownloadConfig) -> Result<DownloadHandle> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TorrentError::not_possible_at_runtime("session is shutting down").into());
        }
        config.validate()?;
        config.validate_files(info.files.len())?;
        if self.get(&info.info_hash).is_some() {
            return Err(TorrentError::duplicate_download(&info.info_hash).into());
        }

        let hex = info.info_hash_hex();
        let dir = self.config.downloads_dir();
        let descriptor_path = dir.join(format!("{}.{}", hex, DESCRIPTOR_EXTENSION));
        let state_path = PState::path_in(&dir, &hex);
        let state = PState::new(&info, config.clone(), DownloadStatus::Created, 0.0);
        let bytes = info.to_bytes();
        self.disk
            .run(move || {
                write_atomic(&descriptor_path, &bytes)?;
                state.save(&state_path)
            })
            .await?;

        let name = info.name.clone();
        let (handle, task) = spawn_download(Arc::new(info), config, self.engine_context(), None, true);
        let handle = self.register(handle, task)?;
        info!("Added download {} ({})", hex, name);
        Ok(handle)
    }

    /// Add from a `.torrent` path or an HTTP(S) URL
    pub async fn add_source(&self, source: &str, config: DownloadConfig) -> Result<DownloadHandle> {
        let info = load_descriptor(source).await?;
        self.add(info, config).await
    }

    /// Stop a download and drop it from the session
    pub async fn remove(&self, info_hash: &[u8; 20], remove_state: bool, remove_content: bool) -> Result<()> {
        let registered = self
            .downloads
            .lock()
            .map_err(|_| TorrentError::io_error("Download registry poisoned"))?
            .remove(info_hash);
        let Some(registered) = registered else {
            return Err(TorrentError::config_invalid_field(
                format!("No download {}", hex::encode(info_hash)),
                "info_hash",
            )
            .into());
        };
        let result = registered.handle.stop(remove_state, remove_content).await;
        registered.handle.shutdown(false).await;
        let _ = registered.task.await;

        if remove_state {
            let cached = self
                .config
                .downloads_dir()
                .join(format!("{}.{}", hex::encode(info_hash), DESCRIPTOR_EXTENSION));
            if let Err(e) = std::fs::remove_file(&cached) {
                debug!("Cached descriptor {} not removed: {}", cached.display(), e);
            }
        }
        info!("Removed download {}", hex::encode(info_hash));
        result
    }

    /// Checkpoint every download; returns how many were written
    pub async fn checkpoint_all(&self) -> Result<usize> {
        let mut written = 0;
        let mut first_error = None;
        for handle in self.downloads() {
            match handle.checkpoint().await {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!("Checkpoint of {} failed: {:#}", handle.info_hash_hex(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    // ---- restore ----

    async fn restore_downloads(&self) -> Result<usize> {
        let dir = self.config.downloads_dir();
        let paths = self.disk.run(move || list_checkpoints(&dir)).await?;
        let mut restored = 0;
        for path in paths {
            match self.restore_one(&path).await {
                Ok(handle) => {
                    debug!("Restored {} from {}", handle.info_hash_hex(), path.display());
                    restored += 1;
                }
                Err(e) => match ErrorKind::of(&e) {
                    ErrorKind::StateCorruption | ErrorKind::MalformedDescriptor => {
                        warn!("Checkpoint {} is unusable: {:#}", path.display(), e);
                        quarantine(&path);
                    }
                    _ => warn!("Could not restore {}: {:#}", path.display(), e),
                },
            }
        }
        Ok(restored)
    }

    async fn restore_one(&self, path: &Path) -> Result<DownloadHandle> {
        let state_path = path.to_path_buf();
        let (state, info) = self
            .disk
            .run(move || {
                let state = PState::load(&state_path)?;
                let info = match state.descriptor()? {
                    Some(info) => info,
                    None => {
                        let cached = state_path.with_extension(DESCRIPTOR_EXTENSION);
                        if !cached.exists() {
                            return Err(TorrentError::state_corruption(
                                "Checkpoint carries no descriptor and none is cached",
                                state_path.display().to_string(),
                            )
                            .into());
                        }
                        TorrentParser::parse_file(&cached)?
                    }
                };
                if info.info_hash_hex() != state.info_hash {
                    return Err(TorrentError::state_corruption(
                        "Descriptor does not match the checkpoint",
                        state_path.display().to_string(),
                    )
                    .into());
                }
                Ok((state, info))
            })
            .await?;

        // Stopped downloads stay stopped
        let autostart = !state.status.is_stopped();
        let config = state.config.clone();
        let (handle, task) = spawn_download(Arc::new(info), config, self.engine_context(), Some(state), autostart);
        self.register(handle, task)
    }

    // ---- background tasks ----

    fn spawn_acceptor(self: &Arc<Self>, listener: TcpListener) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if session.closing.load(Ordering::SeqCst) {
                    break;
                }
                tokio::spawn(async move { session.dispatch(stream, addr).await });
            }
            debug!("Acceptor stopped");
        });
        if let Ok(mut acceptor) = self.acceptor.lock() {
            *acceptor = Some(task);
        }
    }

    /// Read the handshake and hand the stream to the download it names
    async fn dispatch(&self, mut stream: TcpStream, addr: SocketAddr) {
        let mut wire = BitTorrentWire::default();
        let handshake = match timeout(HANDSHAKE_TIMEOUT, wire.read_handshake(&mut stream)).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                debug!("Bad handshake from {}: {:#}", addr, e);
                return;
            }
            Err(_) => {
                debug!("Handshake timeout from {}", addr);
                return;
            }
        };
        match self.get(&handshake.info_hash) {
            Some(handle) => {
                if !handle.incoming(stream, addr, handshake) {
                    debug!("Download {} is gone; dropping {}", handle.info_hash_hex(), addr);
                }
            }
            None => debug!(
                "Rejecting {}: unknown info hash {}",
                addr,
                hex::encode(handshake.info_hash)
            ),
        }
    }

    fn spawn_allocator(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ALLOCATE_INTERVAL);
            loop {
                tick.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.allocate_rates();
            }
        });
        self.push_task(task);
    }

    /// Split the session caps across running downloads
    pub fn allocate_rates(&self) {
        let config = self.runtime_config();
        let allocator = RateAllocator::new(
            config.max_upload_rate,
            config.max_download_rate,
            config.max_seed_upload_rate,
        );
        let handles = self.downloads();
        let inputs: Vec<AllocationInput> = handles
            .iter()
            .map(|h| {
                let status = h.state().status;
                AllocationInput {
                    fixed_up: h.get_max_desired_speed(Direction::Up),
                    fixed_down: h.get_max_desired_speed(Direction::Down),
                    seeding: status == DownloadStatus::Seeding,
                    active: matches!(status, DownloadStatus::Downloading | DownloadStatus::Seeding),
                }
            })
            .collect();
        for (handle, allocation) in handles.iter().zip(allocator.allocate(&inputs)) {
            handle.set_allocation(allocation);
        }
    }

    // ---- runtime configuration ----

    fn update_runtime<T>(&self, change: impl FnOnce(&mut RuntimeConfig) -> T) -> Result<T> {
        let (result, snapshot) = {
            let mut runtime = self
                .runtime
                .lock()
                .map_err(|_| TorrentError::io_error("Runtime config poisoned"))?;
            let result = change(&mut runtime);
            (result, runtime.get().clone())
        };
        snapshot.save()?;
        Ok(result)
    }

    pub async fn set_max_upload_rate(&self, rate: u64) -> Result<SetOutcome> {
        let outcome = self.update_runtime(|r| r.set_max_upload_rate(rate))?;
        self.global.set_rate(Direction::Up, rate).await;
        self.allocate_rates();
        Ok(outcome)
    }

    pub async fn set_max_download_rate(&self, rate: u64) -> Result<SetOutcome> {
        let outcome = self.update_runtime(|r| r.set_max_download_rate(rate))?;
        self.global.set_rate(Direction::Down, rate).await;
        self.allocate_rates();
        Ok(outcome)
    }

    pub fn set_max_seed_upload_rate(&self, rate: u64) -> Result<SetOutcome> {
        let outcome = self.update_runtime(|r| r.set_max_seed_upload_rate(rate))?;
        self.allocate_rates();
        Ok(outcome)
    }

    pub fn set_listen_port(&self, port: u16) -> Result<SetOutcome> {
        self.update_runtime(|r| r.set_listen_port(port))
    }

    pub fn set_ip_for_tracker(&self, ip: Option<String>) -> Result<SetOutcome> {
        self.update_runtime(|r| r.set_ip_for_tracker(ip))
    }

    pub fn set_dht_enabled(&self, enabled: bool) -> Result<SetOutcome> {
        self.update_runtime(|r| r.set_dht_enabled(enabled))
    }

    pub fn set_checkpoint_interval(&self, secs: u64) -> Result<SetOutcome> {
        self.update_runtime(|r| r.set_checkpoint_interval(secs))?
    }

    pub fn set_upnp_mode(&self, mode: UpnpMode) -> Result<SetOutcome> {
        self.update_runtime(|r| r.set_upnp_mode(mode))
    }

    // ---- internal tracker ----

    /// Directory of descriptors served by the internal tracker
    pub fn internal_tracker_dir(&self) -> Result<PathBuf> {
        if !self.config.internal_tracker {
            return Err(TorrentError::not_enabled("internal tracker").into());
        }
        Ok(self.config.itracker_dir())
    }

    /// Make `info` available to the internal tracker
    pub async fn publish_to_internal_tracker(&self, info: &TorrentInfo) -> Result<PathBuf> {
        let dir = self.internal_tracker_dir()?;
        let path = dir.join(format!("{}.{}", info.info_hash_hex(), DESCRIPTOR_EXTENSION));
        let (target, bytes) = (path.clone(), info.to_bytes());
        self.disk.run(move || write_atomic(&target, &bytes)).await?;
        info!("Published {} to the internal tracker", info.info_hash_hex());
        Ok(path)
    }

    // ---- shutdown ----

    /// Stop accepting, tear every download down and write its checkpoint.
    ///
    /// Downloads still busy when `gracetime` runs out are cut off; their last
    /// periodic checkpoint stays on disk.
    pub async fn shutdown(&self, gracetime: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Session shutting down (grace {:?})", gracetime);
        if let Some(acceptor) = self.acceptor.lock().ok().and_then(|mut a| a.take()) {
            acceptor.abort();
        }

        let registered: Vec<Registered> = match self.downloads.lock() {
            Ok(mut downloads) => downloads.drain().map(|(_, r)| r).collect(),
            Err(_) => Vec::new(),
        };
        let mut pending = JoinSet::new();
        for r in &registered {
            let handle = r.handle.clone();
            pending.spawn(async move { handle.shutdown(true).await });
        }
        let drained = timeout(gracetime, async {
            while pending.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!("Grace time expired with {} downloads still closing", pending.len());
            pending.abort_all();
        }
        for r in registered {
            if drained {
                let _ = r.task.await;
            } else {
                r.task.abort();
            }
        }

        self.disk.close();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Err(e) = self.runtime_config().save() {
            warn!("Could not save session config: {:#}", e);
        }
        info!("Session stopped");
    }
}

/// `*.state` files in `dir`, sorted by name
fn list_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| TorrentError::io_error_full("Failed to list checkpoints", dir.display().to_string(), e.to_string()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == STATE_EXTENSION))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Move an unusable checkpoint aside so the next start skips it
fn quarantine(path: &Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(".");
    target.push(CORRUPT_SUFFIX);
    let target = PathBuf::from(target);
    match std::fs::rename(path, &target) {
        Ok(()) => info!("Moved {} to {}", path.display(), target.display()),
        Err(e) => warn!("Could not move {} aside: {}", path.display(), e),
    }
}

/// Parse a descriptor from a file path or an HTTP(S) URL
pub async fn load_descriptor(source: &str) -> Result<TorrentInfo> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return fetch_descriptor(source).await;
    }
    let path = PathBuf::from(source);
    tokio::task::spawn_blocking(move || TorrentParser::parse_file(&path)).await?
}

#[cfg(feature = "http-tracker")]
async fn fetch_descriptor(url: &str) -> Result<TorrentInfo> {
    debug!("Fetching descriptor from {}", url);
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| TorrentError::network_error_full("Failed to fetch descriptor", url.to_string(), e.to_string()))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| TorrentError::network_error_full("Failed to read descriptor", url.to_string(), e.to_string()))?;
    TorrentParser::parse_bytes(&bytes)
}

#[cfg(not(feature = "http-tracker"))]
async fn fetch_descriptor(_url: &str) -> Result<TorrentInfo> {
    Err(TorrentError::not_enabled("fetching descriptors over HTTP").into())
}
