//! Tracker request and response types
//!
//! Announce parameters shared by the HTTP and UDP transports, and the bencoded
//! response parser for HTTP trackers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};

/// Announce event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceEvent {
    /// Regular interval announce
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    /// Value of the HTTP `event` parameter; None is omitted
    pub fn as_query(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }

    /// Event code of the UDP announce packet
    pub fn udp_code(&self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
    /// Address reported to the tracker instead of the source address
    pub ip: Option<String>,
    /// Random key identifying this client across IP changes
    pub key: u32,
}

/// Tracker reply to an announce
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub warning: Option<String>,
    pub peers: Vec<SocketAddr>,
}

/// Swarm counts returned by a scrape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeStats {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

fn read_count(dict: &Value, key: &str) -> Option<u32> {
    dict.get(key).and_then(Value::as_int).map(|v| v.clamp(0, u32::MAX as i64) as u32)
}

/// Parse a bencoded HTTP announce body
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value = bencode::decode(body)
        .map_err(|e| TorrentError::tracker_unreachable(format!("Invalid tracker response: {:#}", e)))?;
    if value.as_dict().is_none() {
        return Err(TorrentError::tracker_unreachable("Tracker response is not a dictionary").into());
    }

    if let Some(reason) = value.get("failure reason").and_then(Value::as_str) {
        return Err(TorrentError::tracker_unreachable(format!("Tracker failure: {}", reason)).into());
    }

    let interval = match value.get("interval").and_then(Value::as_int) {
        Some(i) if i < 0 => {
            return Err(TorrentError::tracker_unreachable(format!("Negative interval {}", i)).into());
        }
        Some(i) => i.min(u32::MAX as i64) as u32,
        None => return Err(TorrentError::tracker_unreachable("Tracker response has no interval").into()),
    };
    let min_interval = match value.get("min interval").and_then(Value::as_int) {
        Some(i) if i < 0 => {
            return Err(TorrentError::tracker_unreachable(format!("Negative min interval {}", i)).into());
        }
        other => other.map(|i| i.min(u32::MAX as i64) as u32),
    };

    let mut peers = match value.get("peers") {
        Some(Value::Bytes(bytes)) => parse_compact_peers(bytes)?,
        Some(Value::List(list)) => parse_dict_peers(list),
        Some(_) => return Err(TorrentError::tracker_unreachable("Unsupported peers encoding").into()),
        None => Vec::new(),
    };
    if let Some(Value::Bytes(bytes)) = value.get("peers6") {
        peers.extend(parse_compact_peers6(bytes)?);
    }

    let warning = value.get("warning message").and_then(Value::as_str);
    if let Some(w) = &warning {
        warn!("Tracker warning: {}", w);
    }
    trace!("Tracker returned {} peers, interval {}s", peers.len(), interval);

    Ok(AnnounceResponse {
        interval,
        min_interval,
        tracker_id: value.get("tracker id").and_then(Value::as_str),
        complete: read_count(&value, "complete"),
        incomplete: read_count(&value, "incomplete"),
        warning,
        peers,
    })
}

/// Parse a bencoded HTTP scrape body for one info hash
pub fn parse_scrape_response(body: &[u8], info_hash: &[u8; 20]) -> Result<ScrapeStats> {
    let value = bencode::decode(body)
        .map_err(|e| TorrentError::tracker_unreachable(format!("Invalid scrape response: {:#}", e)))?;
    if let Some(reason) = value.get("failure reason").and_then(Value::as_str) {
        return Err(TorrentError::tracker_unreachable(format!("Scrape failure: {}", reason)).into());
    }
    let entry = value
        .get("files")
        .and_then(Value::as_dict)
        .and_then(|files| files.get(info_hash.as_slice()))
        .ok_or_else(|| TorrentError::tracker_unreachable("Scrape response does not list this torrent"))?;
    Ok(ScrapeStats {
        complete: read_count(entry, "complete").unwrap_or(0),
        incomplete: read_count(entry, "incomplete").unwrap_or(0),
        downloaded: read_count(entry, "downloaded").unwrap_or(0),
    })
}

/// Decode 6-byte compact IPv4 peers
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(TorrentError::tracker_unreachable(format!(
            "Compact peer list length {} is not a multiple of 6",
            bytes.len()
        ))
        .into());
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .filter(|a| a.port() != 0)
        .collect())
}

/// Decode 18-byte compact IPv6 peers
pub fn parse_compact_peers6(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 18 != 0 {
        return Err(TorrentError::tracker_unreachable(format!(
            "Compact IPv6 peer list length {} is not a multiple of 18",
            bytes.len()
        ))
        .into());
    }
    Ok(bytes
        .chunks_exact(18)
        .filter_map(|c| {
            let octets: [u8; 16] = c[..16].try_into().ok()?;
            let port = u16::from_be_bytes([c[16], c[17]]);
            (port != 0).then(|| SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        })
        .collect())
}

/// Decode the non-compact list of `{ip, port, peer id}` dictionaries
fn parse_dict_peers(list: &[Value]) -> Vec<SocketAddr> {
    list.iter()
        .filter_map(|entry| {
            let ip: IpAddr = entry.get("ip")?.as_str()?.parse().ok()?;
            let port = u16::try_from(entry.get("port")?.as_int()?).ok()?;
            (port != 0).then_some(SocketAddr::new(ip, port))
        })
        .collect()
}

/// Encode peers in the compact form
pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let IpAddr::V4(ip) = peer.ip() {
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    out
}
