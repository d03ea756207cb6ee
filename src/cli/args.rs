//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// Default state directory when neither `--state-dir` nor `STATE_DIR` is given
pub const DEFAULT_STATE_DIR: &str = ".swarmcore";

/// CLI arguments for the swarmcore operator shim
#[derive(Debug, Parser)]
#[command(name = "swarmcore")]
#[command(about = "Run a BitTorrent session over a state directory", long_about = None)]
pub struct CliArgs {
    /// Session state directory (config, checkpoints, cached descriptors)
    #[arg(long, value_name = "PATH", env = "STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Listening port for TCP peers and UDP (trackers, DHT)
    #[arg(long, value_name = "N")]
    pub listen_port: Option<u16>,

    /// Add a download from a .torrent path or an HTTP(S) URL; repeatable
    #[arg(long = "add", value_name = "PATH_OR_URL")]
    pub add: Vec<String>,

    /// Destination directory for downloads added with --add
    #[arg(long, value_name = "DIR")]
    pub dest: Option<PathBuf>,

    /// Stream this file index of each added download (video-on-demand mode)
    #[arg(long, value_name = "FILE_INDEX")]
    pub vod: Option<usize>,

    /// Mark a stored download as stopped (info hash or unique prefix) and exit
    #[arg(long, value_name = "ID")]
    pub stop: Vec<String>,

    /// List stored downloads and exit
    #[arg(long)]
    pub list: bool,

    /// Exit once every download has completed instead of seeding
    #[arg(long)]
    pub shutdown: bool,

    /// Seconds downloads get to checkpoint when the session stops
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub gracetime: u64,

    /// Enable the DHT peer source
    #[arg(long)]
    pub dht: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    /// Destination for added downloads; defaults to the working directory
    pub fn dest_dir(&self) -> PathBuf {
        self.dest.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Offline commands run without starting a session
    pub fn is_offline(&self) -> bool {
        self.list || !self.stop.is_empty()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
