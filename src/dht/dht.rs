//! DHT service
//!
//! A small Kademlia client on the session's UDP socket: bootstraps from
//! routers and descriptor nodes, looks up peers by info hash and answers
//! ping, find_node, get_peers and announce_peer.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::dht::message::{Body, KrpcMessage, Query, Reply};
use crate::dht::node::{encode_compact_nodes, NodeId};
use crate::dht::routing::{RoutingTable, K};
use crate::error::TorrentError;
use crate::session::udp::UdpMux;

/// Wait for a single KRPC reply
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Parallel queries per lookup round
const ALPHA: usize = 3;
/// Lookup rounds before giving up
const MAX_ROUNDS: usize = 8;
/// Peers remembered per info hash from announce_peer
const MAX_STORED_PEERS: usize = 100;

type Pending = HashMap<Vec<u8>, oneshot::Sender<KrpcMessage>>;

pub struct Dht {
    mux: Arc<UdpMux>,
    our_id: NodeId,
    table: Mutex<RoutingTable>,
    pending: Mutex<Pending>,
    storage: Mutex<HashMap<[u8; 20], Vec<SocketAddr>>>,
    secret: [u8; 20],
    next_tid: Mutex<u16>,
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht").field("our_id", &self.our_id.to_hex()).finish()
    }
}

impl Dht {
    /// Attach to the shared socket and start answering queries
    pub fn start(mux: Arc<UdpMux>) -> (Arc<Self>, JoinHandle<()>) {
        let mut incoming = mux.attach_dht();
        let our_id = NodeId::random();
        let dht = Arc::new(Self {
            mux,
            our_id,
            table: Mutex::new(RoutingTable::new(our_id)),
            pending: Mutex::new(HashMap::new()),
            storage: Mutex::new(HashMap::new()),
            secret: NodeId::random().0,
            next_tid: Mutex::new(rand::random()),
        });
        info!("DHT started with id {}", our_id.to_hex());
        let worker = Arc::clone(&dht);
        let handle = tokio::spawn(async move {
            while let Some((from, data)) = incoming.recv().await {
                if let Err(e) = worker.handle_datagram(from, &data).await {
                    trace!("Ignoring DHT datagram from {}: {:#}", from, e);
                }
            }
        });
        (dht, handle)
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    pub fn node_count(&self) -> usize {
        self.table.lock().map(|t| t.node_count()).unwrap_or(0)
    }

    /// Fill the table by asking each contact for nodes near our own id
    pub async fn bootstrap(self: &Arc<Self>, contacts: Vec<SocketAddr>) {
        let mut set = JoinSet::new();
        for addr in contacts {
            let dht = Arc::clone(self);
            let target = self.our_id;
            set.spawn(async move { dht.query(addr, Query::FindNode { target }).await });
        }
        while set.join_next().await.is_some() {}
        debug!("DHT bootstrap done, {} nodes", self.node_count());
    }

    fn transaction_id(&self) -> Vec<u8> {
        match self.next_tid.lock() {
            Ok(mut tid) => {
                *tid = tid.wrapping_add(1);
                tid.to_be_bytes().to_vec()
            }
            Err(_) => rand::random::<u16>().to_be_bytes().to_vec(),
        }
    }

    /// Send a query and wait for the responder's id and reply; None on timeout or error reply
    pub async fn query(&self, addr: SocketAddr, query: Query) -> Result<Option<(NodeId, Reply)>> {
        let tid = self.transaction_id();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(tid.clone(), tx);
        }
        let message = KrpcMessage::query(tid.clone(), self.our_id, query);
        trace!("DHT {} -> {}", message_method(&message), addr);
        if let Err(e) = self.mux.send_to(&message.encode(), addr).await {
            self.forget(&tid);
            return Err(e);
        }
        match timeout(QUERY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => match (reply.sender, reply.body) {
                (Some(id), Body::Response(r)) => {
                    if let Ok(mut table) = self.table.lock() {
                        table.add_node(id, addr);
                        for (node, node_addr) in &r.nodes {
                            table.add_node(*node, *node_addr);
                        }
                    }
                    Ok(Some((id, r)))
                }
                (_, Body::Error { code, message }) => {
                    debug!("DHT node {} answered error {}: {}", addr, code, message);
                    Ok(None)
                }
                _ => Ok(None),
            },
            _ => {
                self.forget(&tid);
                if let Ok(mut table) = self.table.lock() {
                    table.mark_failed(addr);
                }
                Ok(None)
            }
        }
    }

    fn forget(&self, tid: &[u8]) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(tid);
        }
    }

    /// Iterative get_peers; announces to the closest responders when `announce_port` is set
    pub async fn get_peers(self: &Arc<Self>, info_hash: [u8; 20], announce_port: Option<u16>) -> Vec<SocketAddr> {
        let target = NodeId(info_hash);
        let mut queried: HashSet<SocketAddr> = HashSet::new();
        let mut peers: HashSet<SocketAddr> = HashSet::new();
        let mut tokens: Vec<(NodeId, SocketAddr, Vec<u8>)> = Vec::new();

        for round in 0..MAX_ROUNDS {
            let candidates: Vec<SocketAddr> = match self.table.lock() {
                Ok(table) => table
                    .closest(&target, K)
                    .into_iter()
                    .map(|n| n.addr)
                    .filter(|a| !queried.contains(a))
                    .take(ALPHA)
                    .collect(),
                Err(_) => Vec::new(),
            };
            if candidates.is_empty() {
                break;
            }
            let mut set = JoinSet::new();
            for addr in candidates {
                queried.insert(addr);
                let dht = Arc::clone(self);
                set.spawn(async move { (addr, dht.query(addr, Query::GetPeers { info_hash }).await) });
            }
            while let Some(joined) = set.join_next().await {
                let Ok((addr, Ok(Some((id, reply))))) = joined else {
                    continue;
                };
                peers.extend(reply.values.iter().copied());
                if let Some(token) = reply.token {
                    tokens.push((id, addr, token));
                }
            }
            trace!("DHT lookup round {}: {} peers so far", round, peers.len());
        }

        if let Some(port) = announce_port {
            tokens.sort_by_key(|(id, _, _)| id.distance(&target));
            for (_, addr, token) in tokens.into_iter().take(K) {
                let query = Query::AnnouncePeer { info_hash, port, token };
                if let Err(e) = self.query(addr, query).await {
                    trace!("announce_peer to {} failed: {:#}", addr, e);
                }
            }
        }

        debug!("DHT found {} peers for {}", peers.len(), hex::encode(info_hash));
        peers.into_iter().collect()
    }

    async fn handle_datagram(&self, from: SocketAddr, data: &[u8]) -> Result<()> {
        let message = KrpcMessage::decode(data)?;
        match message.body {
            Body::Query(query) => {
                let sender = message
                    .sender
                    .ok_or_else(|| TorrentError::protocol_violation_with_peer("DHT query without id", from.to_string()))?;
                if let Ok(mut table) = self.table.lock() {
                    table.add_node(sender, from);
                }
                let reply = self.answer(message.transaction, from, query);
                self.mux.send_to(&reply.encode(), from).await
            }
            Body::Response(_) | Body::Error { .. } => {
                let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&message.transaction));
                if let Some(tx) = waiter {
                    let _ = tx.send(message);
                } else {
                    trace!("Unsolicited DHT reply from {}", from);
                }
                Ok(())
            }
        }
    }

    fn answer(&self, tid: Vec<u8>, from: SocketAddr, query: Query) -> KrpcMessage {
        let closest = |target: &NodeId| {
            self.table
                .lock()
                .map(|t| encode_compact_nodes(&t.closest(target, K)))
                .unwrap_or_default()
        };
        let reply = match query {
            Query::Ping => Reply::default(),
            Query::FindNode { target } => Reply {
                nodes_raw: closest(&target),
                ..Reply::default()
            },
            Query::GetPeers { info_hash } => {
                let values = self
                    .storage
                    .lock()
                    .ok()
                    .and_then(|s| s.get(&info_hash).cloned())
                    .unwrap_or_default();
                Reply {
                    nodes_raw: if values.is_empty() { closest(&NodeId(info_hash)) } else { Vec::new() },
                    values,
                    token: Some(self.token_for(&from)),
                    ..Reply::default()
                }
            }
            Query::AnnouncePeer { info_hash, port, token } => {
                if token != self.token_for(&from) {
                    warn!("DHT announce_peer from {} with bad token", from);
                    return KrpcMessage::error(tid, 203, "Bad token");
                }
                if let Ok(mut storage) = self.storage.lock() {
                    let peers = storage.entry(info_hash).or_default();
                    let peer = SocketAddr::new(from.ip(), port);
                    if !peers.contains(&peer) {
                        if peers.len() >= MAX_STORED_PEERS {
                            peers.remove(0);
                        }
                        peers.push(peer);
                    }
                }
                Reply::default()
            }
        };
        KrpcMessage::response(tid, self.our_id, reply)
    }

    /// Write token bound to the querying IP
    fn token_for(&self, addr: &SocketAddr) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(self.secret);
        hasher.update(addr.ip().to_string().as_bytes());
        hasher.finalize()[..8].to_vec()
    }
}

fn message_method(message: &KrpcMessage) -> &'static str {
    match &message.body {
        Body::Query(q) => q.method(),
        Body::Response(_) => "response",
        Body::Error { .. } => "error",
    }
}

/// Resolve `host:port` contacts, skipping ones that fail
pub async fn resolve_contacts(contacts: &[(String, u16)]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for (host, port) in contacts {
        match tokio::net::lookup_host((host.as_str(), *port)).await {
            Ok(mut addrs) => out.extend(addrs.next()),
            Err(e) => debug!("Cannot resolve DHT contact {}:{}: {}", host, port, e),
        }
    }
    out
}
