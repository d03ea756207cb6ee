//! Session configuration
//!
//! [`SessionConfig`] is the immutable value a session starts with; it is stored
//! as JSON in `state_dir/config`. [`RuntimeConfig`] is the mutable copy a live
//! session holds. Its setters report whether a change is already in effect or
//! waits for the next start.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::download::{write_atomic, SetOutcome};
use crate::error::TorrentError;
use crate::tracker::UdpRetryPolicy;

/// File name of the stored configuration inside the state directory
pub const CONFIG_FILE: &str = "config";

/// Subdirectory holding checkpoints and cached descriptors
pub const DOWNLOADS_DIR: &str = "downloads";

/// Subdirectory of descriptors served by the internal tracker
pub const ITRACKER_DIR: &str = "itracker";

/// Port mapping mode; stored but never acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpnpMode {
    #[default]
    Disabled,
    Win32Nat,
    Win32Upnp,
    Universal,
}

/// Startup configuration of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub state_dir: PathBuf,
    pub install_dir: Option<PathBuf>,
    pub keypair_file: Option<PathBuf>,
    /// TCP and UDP listen port; 0 picks a free one
    pub listen_port: u16,
    /// Address reported to trackers as `ip`
    pub ip_for_tracker: Option<String>,
    /// Local addresses to bind; the first one is used, empty means all interfaces
    pub bind_addresses: Vec<IpAddr>,
    pub ipv6_binds_v4: bool,
    pub upnp_mode: UpnpMode,
    pub autoclose_timeout: u64,
    pub autoclose_check_interval: u64,

    pub internal_tracker: bool,
    pub tracker_allowed_dir: Option<PathBuf>,
    pub tracker_allowed_list: Option<PathBuf>,
    pub tracker_allowed_ips: Vec<String>,
    pub tracker_banned_ips: Vec<String>,
    pub tracker_scrape_allowed: String,
    pub tracker_reannounce_interval: u64,
    pub tracker_response_size: u32,
    pub tracker_nat_check: u32,
    pub tracker_multitracker_enabled: bool,
    pub tracker_multitracker_allowed: String,
    pub tracker_multitracker_reannounce_interval: u64,
    pub tracker_multitracker_maxpeers: u32,
    pub tracker_multitracker_http_timeout: u64,

    pub video_analyser_path: Option<PathBuf>,
    pub megacache: bool,
    pub torrent_collecting_dir: Option<PathBuf>,
    pub torrent_collecting_rate: u64,
    pub torrent_collecting_max: u32,

    /// Session upload cap in bytes/s; 0 is unlimited
    pub max_upload_rate: u64,
    pub max_download_rate: u64,
    /// Upload cap while every download is seeding; 0 falls back to `max_upload_rate`
    pub max_seed_upload_rate: u64,
    pub max_rate_period: f64,
    /// Worker threads for hashing and file I/O
    pub disk_workers: usize,
    /// Queued disk jobs before downloads throttle requests
    pub disk_queue: usize,
    pub tracker_enabled: bool,
    pub http_timeout_secs: u64,
    pub udp_retry: UdpRetryPolicy,
    pub dht_enabled: bool,
    /// `host:port` routers contacted when the routing table is empty
    pub dht_routers: Vec<String>,
    pub checkpoint_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".swarmcore"),
            install_dir: None,
            keypair_file: None,
            listen_port: 7762,
            ip_for_tracker: None,
            bind_addresses: Vec::new(),
            ipv6_binds_v4: true,
            upnp_mode: UpnpMode::Disabled,
            autoclose_timeout: 0,
            autoclose_check_interval: 60,
            internal_tracker: false,
            tracker_allowed_dir: None,
            tracker_allowed_list: None,
            tracker_allowed_ips: Vec::new(),
            tracker_banned_ips: Vec::new(),
            tracker_scrape_allowed: "full".to_string(),
            tracker_reannounce_interval: 1800,
            tracker_response_size: 50,
            tracker_nat_check: 3,
            tracker_multitracker_enabled: false,
            tracker_multitracker_allowed: "autodetect".to_string(),
            tracker_multitracker_reannounce_interval: 120,
            tracker_multitracker_maxpeers: 20,
            tracker_multitracker_http_timeout: 60,
            video_analyser_path: None,
            megacache: false,
            torrent_collecting_dir: None,
            torrent_collecting_rate: 50,
            torrent_collecting_max: 5000,
            max_upload_rate: 0,
            max_download_rate: 0,
            max_seed_upload_rate: 0,
            max_rate_period: 1.0,
            disk_workers: 4,
            disk_queue: 256,
            tracker_enabled: true,
            http_timeout_secs: 30,
            udp_retry: UdpRetryPolicy::default(),
            dht_enabled: false,
            dht_routers: vec!["router.bittorrent.com:6881".to_string()],
            checkpoint_interval_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_invalid_field("state_dir cannot be empty", "state_dir").into());
        }
        if self.disk_workers == 0 {
            return Err(TorrentError::config_invalid_field("disk_workers must be at least 1", "disk_workers").into());
        }
        if self.disk_queue == 0 {
            return Err(TorrentError::config_invalid_field("disk_queue must be at least 1", "disk_queue").into());
        }
        if !(self.max_rate_period > 0.0) {
            return Err(TorrentError::config_invalid_field("max_rate_period must be positive", "max_rate_period").into());
        }
        if self.checkpoint_interval_secs == 0 {
            return Err(
                TorrentError::config_invalid_field("checkpoint_interval_secs must be positive", "checkpoint_interval_secs")
                    .into(),
            );
        }
        if self.http_timeout_secs == 0 {
            return Err(TorrentError::config_invalid_field("http_timeout_secs must be positive", "http_timeout_secs").into());
        }
        for router in &self.dht_routers {
            if router.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                return Err(
                    TorrentError::config_invalid_field(format!("DHT router '{}' is not host:port", router), "dht_routers")
                        .into(),
                );
            }
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.state_dir.join(DOWNLOADS_DIR)
    }

    pub fn itracker_dir(&self) -> PathBuf {
        self.state_dir.join(ITRACKER_DIR)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn rate_period(&self) -> Duration {
        Duration::from_secs_f64(self.max_rate_period)
    }

    /// Routers as `(host, port)` pairs
    pub fn dht_router_contacts(&self) -> Vec<(String, u16)> {
        self.dht_routers
            .iter()
            .filter_map(|r| {
                let (host, port) = r.rsplit_once(':')?;
                Some((host.to_string(), port.parse().ok()?))
            })
            .collect()
    }

    /// Read `state_dir/config`; None when the file does not exist
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = state_dir.join(CONFIG_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(
                    TorrentError::io_error_full("Failed to read session config", path.display().to_string(), e.to_string())
                        .into(),
                )
            }
        };
        let mut config: SessionConfig = serde_json::from_slice(&data).map_err(|e| {
            TorrentError::state_corruption(format!("Session config does not decode: {}", e), path.display().to_string())
        })?;
        // The directory the file was found in wins over a stale stored value
        config.state_dir = state_dir.to_path_buf();
        debug!("Loaded session config from {}", path.display());
        Ok(Some(config))
    }

    pub fn save(&self) -> Result<()> {
        let path = self.config_path();
        write_atomic(&path, &serde_json::to_vec_pretty(self)?)?;
        debug!("Session config written to {}", path.display());
        Ok(())
    }
}

/// Mutable configuration of a running session
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    current: SessionConfig,
}

impl RuntimeConfig {
    pub fn new(startup: SessionConfig) -> Self {
        Self { current: startup }
    }

    /// Values as they stand, deferred changes included
    pub fn get(&self) -> &SessionConfig {
        &self.current
    }

    pub fn set_max_upload_rate(&mut self, rate: u64) -> SetOutcome {
        self.current.max_upload_rate = rate;
        SetOutcome::Applied
    }

    pub fn set_max_download_rate(&mut self, rate: u64) -> SetOutcome {
        self.current.max_download_rate = rate;
        SetOutcome::Applied
    }

    pub fn set_max_seed_upload_rate(&mut self, rate: u64) -> SetOutcome {
        self.current.max_seed_upload_rate = rate;
        SetOutcome::Applied
    }

    pub fn set_listen_port(&mut self, port: u16) -> SetOutcome {
        self.current.listen_port = port;
        SetOutcome::deferred("listen sockets are bound at session start")
    }

    pub fn set_ip_for_tracker(&mut self, ip: Option<String>) -> SetOutcome {
        self.current.ip_for_tracker = ip;
        SetOutcome::deferred("downloads pick up the tracker address when they start")
    }

    pub fn set_dht_enabled(&mut self, enabled: bool) -> SetOutcome {
        self.current.dht_enabled = enabled;
        SetOutcome::deferred("the DHT node is created at session start")
    }

    pub fn set_checkpoint_interval(&mut self, secs: u64) -> Result<SetOutcome> {
        if secs == 0 {
            return Err(
                TorrentError::config_invalid_field("checkpoint interval must be positive", "checkpoint_interval_secs").into(),
            );
        }
        self.current.checkpoint_interval_secs = secs;
        Ok(SetOutcome::deferred("downloads pick up the interval when they start"))
    }

    pub fn set_autoclose_timeout(&mut self, secs: u64) -> SetOutcome {
        self.current.autoclose_timeout = secs;
        info!("autoclose_timeout set to {} (stored only)", secs);
        SetOutcome::Applied
    }

    pub fn set_upnp_mode(&mut self, mode: UpnpMode) -> SetOutcome {
        self.current.upnp_mode = mode;
        SetOutcome::deferred("port mapping is configured at session start")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_keeps_pass_throughs() {
        let dir = TempDir::new().unwrap();
        let mut config = SessionConfig::new(dir.path());
        config.upnp_mode = UpnpMode::Win32Upnp;
        config.megacache = true;
        config.tracker_allowed_ips = vec!["10.0.0.0/8".into()];
        config.torrent_collecting_dir = Some(PathBuf::from("/srv/collect"));
        config.save().unwrap();

        let loaded = SessionConfig::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, config);
        assert!(SessionConfig::load(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), b"listen_port = 1").unwrap();
        let err = SessionConfig::load(dir.path()).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::StateCorruption);
    }

    #[test]
    fn test_validate() {
        let mut config = SessionConfig::new("/tmp/s");
        assert!(config.validate().is_ok());
        config.disk_workers = 0;
        assert_eq!(ErrorKind::of(&config.validate().unwrap_err()), ErrorKind::ConfigurationInvalid);
        config.disk_workers = 1;
        config.dht_routers = vec!["no-port".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runtime_setters_report_outcome() {
        let mut runtime = RuntimeConfig::new(SessionConfig::default());
        assert!(runtime.set_max_upload_rate(1000).is_applied());
        assert!(!runtime.set_listen_port(9000).is_applied());
        assert_eq!(runtime.get().listen_port, 9000);
        assert!(runtime.set_checkpoint_interval(0).is_err());
    }

    #[test]
    fn test_router_contacts() {
        let config = SessionConfig {
            dht_routers: vec!["router.example:6881".into(), "[::1]:7000".into()],
            ..SessionConfig::default()
        };
        assert_eq!(
            config.dht_router_contacts(),
            vec![("router.example".to_string(), 6881), ("[::1]".to_string(), 7000)]
        );
    }
}
