//! DHT routing table module
//!
//! Kademlia buckets indexed by shared prefix length with our id.

use std::net::SocketAddr;

use tracing::trace;

use crate::dht::node::{Node, NodeId};

/// Contacts per bucket
pub const K: usize = 8;

#[derive(Debug)]
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Vec<Node>>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            buckets: (0..160).map(|_| Vec::with_capacity(K)).collect(),
        }
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.our_id.common_prefix_len(id).min(159)
    }

    /// Insert or refresh a contact; a full bucket evicts its worst bad node
    pub fn add_node(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        if id == self.our_id {
            return false;
        }
        let index = self.bucket_index(&id);
        let bucket = &mut self.buckets[index];
        if let Some(node) = bucket.iter_mut().find(|n| n.id == id) {
            node.addr = addr;
            node.touch();
            return true;
        }
        if bucket.len() >= K {
            let Some(bad) = bucket.iter().position(|n| !n.is_good()) else {
                return false;
            };
            trace!("Evicting {} from bucket {}", bucket[bad].addr, index);
            bucket.remove(bad);
        }
        bucket.push(Node::new(id, addr));
        true
    }

    /// Count an unanswered query against the node at `addr`
    pub fn mark_failed(&mut self, addr: SocketAddr) {
        for node in self.buckets.iter_mut().flatten().filter(|n| n.addr == addr) {
            node.failures += 1;
        }
    }

    pub fn remove_node(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        self.buckets[index].retain(|n| n.id != *id);
    }

    /// The `count` contacts closest to `target`, good nodes only
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.buckets.iter().flatten().filter(|n| n.is_good()).cloned().collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(count);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}
