//! DHT node module
//!
//! Node identifiers, XOR distance and the compact node encoding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::Rng;

/// Nodes silent for longer than this are questionable
pub const GOOD_NODE_AGE: Duration = Duration::from_secs(15 * 60);

/// 160-bit node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance, comparable as a big-endian number
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut d = [0u8; 20];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        d
    }

    /// Number of leading bits shared with `other`
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let d = self.distance(other);
        d.iter()
            .position(|b| *b != 0)
            .map_or(160, |i| i * 8 + d[i].leading_zeros() as usize)
    }
}

/// A contact in the routing table
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    /// Queries that went unanswered since the last reply
    pub failures: u32,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    pub fn is_good(&self) -> bool {
        self.failures < 2 && self.last_seen.elapsed() < GOOD_NODE_AGE
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }
}

/// Decode 26-byte compact node infos
pub fn decode_compact_nodes(bytes: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    bytes
        .chunks_exact(26)
        .filter_map(|c| {
            let id = NodeId::from_slice(&c[..20])?;
            let ip = Ipv4Addr::new(c[20], c[21], c[22], c[23]);
            let port = u16::from_be_bytes([c[24], c[25]]);
            (port != 0).then(|| (id, SocketAddr::new(IpAddr::V4(ip), port)))
        })
        .collect()
}

/// Encode IPv4 nodes in the compact form
pub fn encode_compact_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let IpAddr::V4(ip) = node.addr.ip() {
            out.extend_from_slice(&node.id.0);
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&node.addr.port().to_be_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_and_prefix() {
        let a = NodeId([0xFF; 20]);
        let b = NodeId([0x00; 20]);
        assert_eq!(a.distance(&b), [0xFF; 20]);
        assert_eq!(a.common_prefix_len(&a), 160);
        assert_eq!(a.common_prefix_len(&b), 0);
        let mut c = [0u8; 20];
        c[1] = 0x10;
        assert_eq!(b.common_prefix_len(&NodeId(c)), 11);
    }

    #[test]
    fn test_compact_nodes() {
        let node = Node::new(NodeId([7; 20]), "10.0.0.1:6881".parse().unwrap());
        let bytes = encode_compact_nodes(&[node.clone()]);
        assert_eq!(bytes.len(), 26);
        assert_eq!(decode_compact_nodes(&bytes), vec![(node.id, node.addr)]);
        assert!(decode_compact_nodes(&bytes[..25]).is_empty());
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
        assert!(NodeId::from_slice(&[1; 19]).is_none());
    }
}
