//! Layered rate limiter
//!
//! Each direction has three nested buckets: peer, download and global. A
//! transfer proceeds only once every layer it is subject to has the tokens;
//! otherwise the caller sleeps until the tightest bucket refills.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;

use crate::ratelimit::bucket::TokenBucket;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// Shared bucket for one direction of one layer
pub type SharedBucket = Arc<Mutex<TokenBucket>>;

/// Up and down buckets for one layer
#[derive(Debug, Clone)]
pub struct BucketPair {
    pub up: SharedBucket,
    pub down: SharedBucket,
}

impl BucketPair {
    pub fn new(up_rate: u64, down_rate: u64, period: Duration) -> Self {
        Self {
            up: Arc::new(Mutex::new(TokenBucket::new(up_rate, period))),
            down: Arc::new(Mutex::new(TokenBucket::new(down_rate, period))),
        }
    }

    pub fn unlimited(period: Duration) -> Self {
        Self::new(0, 0, period)
    }

    pub fn get(&self, dir: Direction) -> &SharedBucket {
        match dir {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    pub async fn set_rate(&self, dir: Direction, rate: u64) {
        self.get(dir).lock().await.set_rate(rate);
    }

    pub async fn rate(&self, dir: Direction) -> u64 {
        self.get(dir).lock().await.rate()
    }
}

/// Fudge factors applied on top of the raw byte counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateFudge {
    /// Fraction of each received payload charged to the upload buckets as ACK traffic
    pub tcp_ack_fudge: f64,
    /// Seconds of kernel send-buffer lag added to the upload burst
    pub upload_rate_fudge: f64,
}

impl Default for RateFudge {
    fn default() -> Self {
        Self {
            tcp_ack_fudge: 0.03,
            upload_rate_fudge: 0.2,
        }
    }
}

/// The limiter one peer connection goes through
#[derive(Debug, Clone)]
pub struct PeerLimiter {
    peer: BucketPair,
    download: BucketPair,
    /// None when the peer is exempt from the global cap
    global: Option<BucketPair>,
    fudge: RateFudge,
}

impl PeerLimiter {
    pub fn new(
        peer: BucketPair,
        download: BucketPair,
        global: BucketPair,
        fudge: RateFudge,
        exempt_from_global: bool,
    ) -> Self {
        Self {
            peer,
            download,
            global: if exempt_from_global { None } else { Some(global) },
            fudge,
        }
    }

    pub fn peer_buckets(&self) -> &BucketPair {
        &self.peer
    }

    pub fn is_global_exempt(&self) -> bool {
        self.global.is_none()
    }

    fn layers(&self, dir: Direction) -> Vec<&SharedBucket> {
        let mut layers = vec![self.peer.get(dir), self.download.get(dir)];
        if let Some(global) = &self.global {
            layers.push(global.get(dir));
        }
        layers
    }

    /// Wait until `bytes` may be transferred in `dir`, then charge every layer
    pub async fn acquire(&self, dir: Direction, bytes: u64) {
        let slack = match dir {
            Direction::Up => self.fudge.upload_rate_fudge,
            Direction::Down => 0.0,
        };
        loop {
            let mut wait = Duration::ZERO;
            for bucket in self.layers(dir) {
                let mut b = bucket.lock().await;
                let grace = (b.rate() as f64 * slack) as u64;
                wait = wait.max(b.wait_time(bytes.saturating_sub(grace)));
            }
            if wait.is_zero() {
                break;
            }
            trace!("Rate limiter: {:?} {} bytes waits {:?}", dir, bytes, wait);
            tokio::time::sleep(wait).await;
        }
        for bucket in self.layers(dir) {
            bucket.lock().await.consume(bytes);
        }
        if dir == Direction::Down {
            let ack = (bytes as f64 * self.fudge.tcp_ack_fudge) as u64;
            if ack > 0 {
                for bucket in self.layers(Direction::Up) {
                    bucket.lock().await.consume(ack);
                }
            }
        }
    }
}

/// Whether `peer` counts as local for `prioritize_local`
///
/// Loopback, private, link-local and unique-local addresses are local, as is
/// anything on the same /24 (IPv4) or /64 (IPv6) as `our_ip`.
pub fn is_local_peer(peer: &SocketAddr, our_ip: Option<IpAddr>) -> bool {
    match (peer.ip(), our_ip) {
        (IpAddr::V4(p), Some(IpAddr::V4(o))) if p.octets()[..3] == o.octets()[..3] => true,
        (IpAddr::V6(p), Some(IpAddr::V6(o))) if p.segments()[..4] == o.segments()[..4] => true,
        (IpAddr::V4(p), _) => p.is_loopback() || p.is_private() || p.is_link_local(),
        (IpAddr::V6(p), _) => p.is_loopback() || (p.segments()[0] & 0xfe00) == 0xfc00 || (p.segments()[0] & 0xffc0) == 0xfe80,
    }
}
