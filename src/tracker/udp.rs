//! UDP tracker transport
//!
//! Connection-id handshake, announce and scrape over the session's shared UDP
//! socket, retried with exponential backoff.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::TorrentError;
use crate::session::udp::UdpMux;
use crate::tracker::response::{AnnounceRequest, AnnounceResponse, ScrapeStats};

/// Magic constant opening every connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// Lifetime of a connection id handed out by a tracker
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Timeout schedule for UDP tracker requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpRetryPolicy {
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
    pub tries: u32,
}

impl Default for UdpRetryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(15),
            max_timeout: Duration::from_secs(60),
            tries: 8,
        }
    }
}

impl UdpRetryPolicy {
    /// Timeout of the zero-based attempt `n`
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_timeout.saturating_mul(factor).min(self.max_timeout)
    }
}

/// UDP tracker transport
#[derive(Debug)]
pub struct UdpAnnouncer {
    mux: Arc<UdpMux>,
    retry: UdpRetryPolicy,
    connections: Mutex<HashMap<SocketAddr, (u64, Instant)>>,
}

impl UdpAnnouncer {
    pub fn new(mux: Arc<UdpMux>, retry: UdpRetryPolicy) -> Self {
        Self {
            mux,
            retry,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let addr = resolve(url).await?;
        for attempt in 0..self.retry.tries {
            let wait = self.retry.timeout_for(attempt);
            let Some(conn_id) = self.connection_id(addr, wait).await? else {
                debug!("UDP tracker {} connect attempt {} timed out", url, attempt + 1);
                continue;
            };
            let tid = rand::random::<u32>();
            let packet = encode_announce(conn_id, tid, request);
            match self.mux.transact(addr, tid, &packet, wait).await? {
                Some(reply) => return decode_announce(&reply, tid).map_err(|e| with_url(e, url)),
                None => {
                    debug!("UDP tracker {} announce attempt {} timed out", url, attempt + 1);
                    self.forget(addr);
                }
            }
        }
        Err(TorrentError::tracker_unreachable_with_url(
            format!("No answer after {} tries", self.retry.tries),
            url,
        )
        .into())
    }

    pub async fn scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats> {
        let addr = resolve(url).await?;
        for attempt in 0..self.retry.tries {
            let wait = self.retry.timeout_for(attempt);
            let Some(conn_id) = self.connection_id(addr, wait).await? else {
                continue;
            };
            let tid = rand::random::<u32>();
            let mut packet = BytesMut::with_capacity(36);
            packet.put_u64(conn_id);
            packet.put_u32(ACTION_SCRAPE);
            packet.put_u32(tid);
            packet.put_slice(info_hash);
            if let Some(reply) = self.mux.transact(addr, tid, &packet, wait).await? {
                return decode_scrape(&reply, tid).map_err(|e| with_url(e, url));
            }
            self.forget(addr);
        }
        Err(TorrentError::tracker_unreachable_with_url("Scrape got no answer", url).into())
    }

    /// Cached or freshly negotiated connection id; None on timeout
    async fn connection_id(&self, addr: SocketAddr, wait: Duration) -> Result<Option<u64>> {
        if let Some(id) = self.cached(addr) {
            return Ok(Some(id));
        }
        let tid = rand::random::<u32>();
        let mut packet = BytesMut::with_capacity(16);
        packet.put_u64(PROTOCOL_ID);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(tid);
        let Some(reply) = self.mux.transact(addr, tid, &packet, wait).await? else {
            return Ok(None);
        };
        let id = decode_connect(&reply, tid)?;
        trace!("UDP tracker {} gave connection id {:x}", addr, id);
        if let Ok(mut map) = self.connections.lock() {
            map.insert(addr, (id, Instant::now()));
        }
        Ok(Some(id))
    }

    fn cached(&self, addr: SocketAddr) -> Option<u64> {
        let map = self.connections.lock().ok()?;
        map.get(&addr)
            .filter(|(_, at)| at.elapsed() < CONNECTION_ID_TTL)
            .map(|(id, _)| *id)
    }

    fn forget(&self, addr: SocketAddr) {
        if let Ok(mut map) = self.connections.lock() {
            map.remove(&addr);
        }
    }
}

fn with_url(err: anyhow::Error, url: &str) -> anyhow::Error {
    TorrentError::from_anyhow(err, |m| TorrentError::tracker_unreachable(m))
        .with_context(url.to_string())
        .into()
}

/// Resolve `udp://host:port/...` to a socket address
pub async fn resolve(url: &str) -> Result<SocketAddr> {
    let parsed = Url::parse(url).map_err(|e| TorrentError::tracker_unreachable_with_url(e.to_string(), url))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TorrentError::tracker_unreachable_with_url("Missing host", url))?;
    let port = parsed
        .port()
        .ok_or_else(|| TorrentError::tracker_unreachable_with_url("Missing port", url))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| TorrentError::tracker_unreachable_with_url(format!("Cannot resolve: {}", e), url))?;
    let addr = addrs.next();
    addr.ok_or_else(|| TorrentError::tracker_unreachable_with_url("Host resolved to no address", url).into())
}

/// Encode the 98-byte announce packet
pub fn encode_announce(conn_id: u64, tid: u32, request: &AnnounceRequest) -> BytesMut {
    let ip = request
        .ip
        .as_deref()
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .map(u32::from)
        .unwrap_or(0);
    let mut packet = BytesMut::with_capacity(98);
    packet.put_u64(conn_id);
    packet.put_u32(ACTION_ANNOUNCE);
    packet.put_u32(tid);
    packet.put_slice(&request.info_hash);
    packet.put_slice(&request.peer_id);
    packet.put_u64(request.downloaded);
    packet.put_u64(request.left);
    packet.put_u64(request.uploaded);
    packet.put_u32(request.event.udp_code());
    packet.put_u32(ip);
    packet.put_u32(request.key);
    packet.put_i32(i32::try_from(request.numwant).unwrap_or(i32::MAX));
    packet.put_u16(request.port);
    packet
}

/// Check the common `(action, transaction id)` header and surface tracker errors
fn check_header(mut buf: &[u8], tid: u32, action: u32, min_len: usize) -> Result<&[u8]> {
    if buf.len() < 8 {
        return Err(TorrentError::tracker_unreachable("UDP tracker reply too short").into());
    }
    let got_action = buf.get_u32();
    let got_tid = buf.get_u32();
    if got_tid != tid {
        return Err(TorrentError::tracker_unreachable("UDP tracker transaction id mismatch").into());
    }
    if got_action == ACTION_ERROR {
        let message = String::from_utf8_lossy(buf).into_owned();
        warn!("UDP tracker error: {}", message);
        return Err(TorrentError::tracker_unreachable(format!("Tracker failure: {}", message)).into());
    }
    if got_action != action || buf.len() + 8 < min_len {
        return Err(TorrentError::tracker_unreachable(format!(
            "Unexpected UDP tracker reply (action {}, {} bytes)",
            got_action,
            buf.len() + 8
        ))
        .into());
    }
    Ok(buf)
}

pub fn decode_connect(reply: &[u8], tid: u32) -> Result<u64> {
    let mut body = check_header(reply, tid, ACTION_CONNECT, 16)?;
    Ok(body.get_u64())
}

pub fn decode_announce(reply: &[u8], tid: u32) -> Result<AnnounceResponse> {
    let mut body = check_header(reply, tid, ACTION_ANNOUNCE, 20)?;
    let interval = body.get_u32();
    let leechers = body.get_u32();
    let seeders = body.get_u32();
    let peers = body
        .chunks_exact(6)
        .map(|c| {
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(c[0], c[1], c[2], c[3])),
                u16::from_be_bytes([c[4], c[5]]),
            )
        })
        .filter(|a| a.port() != 0)
        .collect();
    Ok(AnnounceResponse {
        interval,
        min_interval: None,
        tracker_id: None,
        complete: Some(seeders),
        incomplete: Some(leechers),
        warning: None,
        peers,
    })
}

pub fn decode_scrape(reply: &[u8], tid: u32) -> Result<ScrapeStats> {
    let mut body = check_header(reply, tid, ACTION_SCRAPE, 20)?;
    let complete = body.get_u32();
    let downloaded = body.get_u32();
    let incomplete = body.get_u32();
    Ok(ScrapeStats {
        complete,
        incomplete,
        downloaded,
    })
}
