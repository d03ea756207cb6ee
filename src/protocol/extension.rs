//! Extension protocol
//!
//! Extension handshake (`m` dictionary) and the receive side of `ut_pex`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};

/// Extension id of the extension handshake itself
pub const HANDSHAKE_ID: u8 = 0;

/// Name of the peer exchange extension
pub const UT_PEX: &str = "ut_pex";

/// Id we ask peers to use when sending us `ut_pex`
pub const LOCAL_UT_PEX_ID: u8 = 1;

/// Upper bound on peers accepted from one `ut_pex` message
pub const MAX_PEX_PEERS: usize = 200;

/// Extension handshake payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionHandshake {
    /// Extension name to the id the sender wants to receive it under
    #[serde(default)]
    pub m: HashMap<String, i64>,
    /// Listen port of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<i64>,
    /// Client name and version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Number of outstanding requests the sender accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,
}

impl ExtensionHandshake {
    /// Our own handshake
    pub fn local(listen_port: u16, request_backlog: u32) -> Self {
        let mut m = HashMap::new();
        m.insert(UT_PEX.to_string(), LOCAL_UT_PEX_ID as i64);
        Self {
            m,
            p: Some(listen_port as i64),
            v: Some(concat!("swarmcore ", env!("CARGO_PKG_VERSION")).to_string()),
            reqq: Some(request_backlog as i64),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self).map_err(TorrentError::from)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let hs: Self = serde_bencode::from_bytes(payload).map_err(TorrentError::from)?;
        for (name, id) in &hs.m {
            if !(0..=255).contains(id) {
                return Err(TorrentError::protocol_violation(format!(
                    "Extension {} mapped to out-of-range id {}",
                    name, id
                ))
                .into());
            }
        }
        Ok(hs)
    }

    /// Id the remote wants for an extension; 0 means disabled
    pub fn id_for(&self, name: &str) -> Option<u8> {
        self.m.get(name).copied().filter(|id| *id > 0).map(|id| id as u8)
    }
}

/// Decoded `ut_pex` message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    /// Parse a `ut_pex` body; anything but a dictionary is a protocol violation
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)
            .map_err(|e| TorrentError::protocol_violation_with_source("ut_pex body is not valid bencode", e.to_string()))?;
        if value.as_dict().is_none() {
            return Err(TorrentError::protocol_violation("ut_pex body is not a dictionary").into());
        }

        let mut added = parse_compact_v4(value.get("added"))?;
        added.extend(parse_compact_v6(value.get("added6"))?);
        let mut dropped = parse_compact_v4(value.get("dropped"))?;
        dropped.extend(parse_compact_v6(value.get("dropped6"))?);

        if added.len() > MAX_PEX_PEERS {
            return Err(TorrentError::protocol_violation(format!(
                "ut_pex added {} peers, limit {}",
                added.len(),
                MAX_PEX_PEERS
            ))
            .into());
        }
        trace!("ut_pex: {} added, {} dropped", added.len(), dropped.len());
        Ok(Self { added, dropped })
    }
}

fn compact_bytes<'a>(value: Option<&'a Value>, stride: usize, field: &str) -> Result<&'a [u8]> {
    let Some(value) = value else {
        return Ok(&[]);
    };
    let bytes = value
        .as_bytes()
        .ok_or_else(|| TorrentError::protocol_violation(format!("ut_pex {} is not a byte string", field)))?;
    if bytes.len() % stride != 0 {
        return Err(TorrentError::protocol_violation(format!("ut_pex {} has a partial entry", field)).into());
    }
    Ok(bytes)
}

fn parse_compact_v4(value: Option<&Value>) -> Result<Vec<SocketAddr>> {
    Ok(compact_bytes(value, 6, "added")?
        .chunks_exact(6)
        .map(parse_compact_peer)
        .collect())
}

fn parse_compact_v6(value: Option<&Value>) -> Result<Vec<SocketAddr>> {
    Ok(compact_bytes(value, 18, "added6")?
        .chunks_exact(18)
        .map(|chunk| {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0))
        })
        .collect())
}

/// Decode one 6-byte compact IPv4 peer
pub fn parse_compact_peer(chunk: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

/// Decode a run of 6-byte compact IPv4 peers, ignoring a trailing partial entry
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    if data.len() % 6 != 0 {
        debug!("Compact peer list has {} trailing bytes", data.len() % 6);
    }
    data.chunks_exact(6).map(parse_compact_peer).collect()
}

/// Encode IPv4 peers in compact form
pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let SocketAddr::V4(v4) = peer {
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::bencode::DictBuilder;

    #[test]
    fn test_handshake_encode_decode() {
        let hs = ExtensionHandshake::local(6881, 250);
        let bytes = hs.encode().unwrap();
        assert!(bytes.starts_with(b"d1:md6:ut_pexi1ee"));
        let decoded = ExtensionHandshake::decode(&bytes).unwrap();
        assert_eq!(decoded.id_for(UT_PEX), Some(LOCAL_UT_PEX_ID));
        assert_eq!(decoded.p, Some(6881));
    }

    #[test]
    fn test_handshake_accepts_any_mapping() {
        let decoded = ExtensionHandshake::decode(b"d1:md6:ut_pexi7e11:ut_metadatai3ee1:v3:abce").unwrap();
        assert_eq!(decoded.id_for(UT_PEX), Some(7));
        assert_eq!(decoded.id_for("ut_metadata"), Some(3));
        assert_eq!(decoded.id_for("missing"), None);
    }

    #[test]
    fn test_handshake_disabled_extension() {
        let decoded = ExtensionHandshake::decode(b"d1:md6:ut_pexi0eee").unwrap();
        assert_eq!(decoded.id_for(UT_PEX), None);
    }

    #[test]
    fn test_handshake_out_of_range_id() {
        assert!(ExtensionHandshake::decode(b"d1:md6:ut_pexi300eee").is_err());
    }

    #[test]
    fn test_pex_added() {
        let added = encode_compact_peers(&["10.0.0.1:6881".parse().unwrap(), "10.0.0.2:51413".parse().unwrap()]);
        let payload = DictBuilder::new().insert("added", Value::Bytes(added)).build().encode();
        let pex = PexMessage::decode(&payload).unwrap();
        assert_eq!(pex.added.len(), 2);
        assert_eq!(pex.added[1], "10.0.0.2:51413".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_pex_non_dict_is_violation() {
        for body in [&b"i42e"[..], b"l1:ae", b"4:spam", b"garbage"] {
            let err = PexMessage::decode(body).unwrap_err();
            assert_eq!(crate::error::ErrorKind::of(&err), crate::error::ErrorKind::ProtocolViolation);
        }
    }

    #[test]
    fn test_pex_partial_entry() {
        let payload = DictBuilder::new().insert("added", Value::Bytes(vec![1, 2, 3])).build().encode();
        assert!(PexMessage::decode(&payload).is_err());
    }

    #[test]
    fn test_compact_peers() {
        let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 9]);
        assert_eq!(peers, vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]);
    }
}
