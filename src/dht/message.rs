//! DHT message module
//!
//! KRPC queries, responses and errors encoded as bencoded dictionaries.

use std::net::SocketAddr;

use anyhow::Result;

use crate::dht::node::{decode_compact_nodes, NodeId};
use crate::error::TorrentError;
use crate::torrent::bencode::{self, DictBuilder, Value};
use crate::tracker::response::{encode_compact_peers, parse_compact_peers};

/// Query methods we send and answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: [u8; 20] },
    AnnouncePeer { info_hash: [u8; 20], port: u16, token: Vec<u8> },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// Fields a response may carry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
    /// Raw compact nodes to send, when answering
    pub nodes_raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query(Query),
    Response(Reply),
    Error { code: i64, message: String },
}

/// One KRPC datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcMessage {
    pub transaction: Vec<u8>,
    /// Sender id; absent on errors
    pub sender: Option<NodeId>,
    pub body: Body,
}

fn malformed(message: &str) -> anyhow::Error {
    TorrentError::protocol_violation_with_source(message.to_string(), "dht").into()
}

impl KrpcMessage {
    pub fn query(transaction: Vec<u8>, sender: NodeId, query: Query) -> Self {
        Self {
            transaction,
            sender: Some(sender),
            body: Body::Query(query),
        }
    }

    pub fn response(transaction: Vec<u8>, sender: NodeId, reply: Reply) -> Self {
        Self {
            transaction,
            sender: Some(sender),
            body: Body::Response(reply),
        }
    }

    pub fn error(transaction: Vec<u8>, code: i64, message: &str) -> Self {
        Self {
            transaction,
            sender: None,
            body: Body::Error {
                code,
                message: message.to_string(),
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let id = self.sender.map(|s| Value::bytes(s.0.to_vec()));
        let builder = DictBuilder::new().insert("t", Value::bytes(self.transaction.clone()));
        let dict = match &self.body {
            Body::Query(query) => {
                let args = DictBuilder::new().insert_opt("id", id);
                let args = match query {
                    Query::Ping => args,
                    Query::FindNode { target } => args.insert("target", Value::bytes(target.0.to_vec())),
                    Query::GetPeers { info_hash } => args.insert("info_hash", Value::bytes(info_hash.to_vec())),
                    Query::AnnouncePeer { info_hash, port, token } => args
                        .insert("info_hash", Value::bytes(info_hash.to_vec()))
                        .insert("port", Value::Int(i64::from(*port)))
                        .insert("token", Value::bytes(token.clone())),
                };
                builder
                    .insert("y", Value::string("q"))
                    .insert("q", Value::string(query.method()))
                    .insert("a", args.build())
            }
            Body::Response(reply) => {
                let mut r = DictBuilder::new().insert_opt("id", id);
                if !reply.nodes_raw.is_empty() {
                    r = r.insert("nodes", Value::bytes(reply.nodes_raw.clone()));
                }
                if !reply.values.is_empty() {
                    let values = reply
                        .values
                        .iter()
                        .map(|p| Value::bytes(encode_compact_peers(std::slice::from_ref(p))))
                        .collect();
                    r = r.insert("values", Value::List(values));
                }
                r = r.insert_opt("token", reply.token.clone().map(Value::bytes));
                builder.insert("y", Value::string("r")).insert("r", r.build())
            }
            Body::Error { code, message } => builder.insert("y", Value::string("e")).insert(
                "e",
                Value::List(vec![Value::Int(*code), Value::string(message)]),
            ),
        };
        dict.build().encode()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let value = bencode::decode(data).map_err(|_| malformed("DHT datagram is not valid bencode"))?;
        let transaction = value
            .get("t")
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("missing transaction id"))?
            .to_vec();
        let kind = value.get("y").and_then(Value::as_str).ok_or_else(|| malformed("missing message type"))?;

        match kind.as_str() {
            "q" => {
                let args = value.get("a").ok_or_else(|| malformed("query without arguments"))?;
                let sender = sender_id(args)?;
                let method = value.get("q").and_then(Value::as_str).ok_or_else(|| malformed("missing method"))?;
                let hash = |key: &str| -> Result<[u8; 20]> {
                    args.get(key)
                        .and_then(Value::as_bytes)
                        .and_then(|b| <[u8; 20]>::try_from(b).ok())
                        .ok_or_else(|| malformed("bad 20-byte argument"))
                };
                let query = match method.as_str() {
                    "ping" => Query::Ping,
                    "find_node" => Query::FindNode {
                        target: NodeId(hash("target")?),
                    },
                    "get_peers" => Query::GetPeers {
                        info_hash: hash("info_hash")?,
                    },
                    "announce_peer" => Query::AnnouncePeer {
                        info_hash: hash("info_hash")?,
                        port: args
                            .get("port")
                            .and_then(Value::as_int)
                            .and_then(|p| u16::try_from(p).ok())
                            .ok_or_else(|| malformed("bad port"))?,
                        token: args
                            .get("token")
                            .and_then(Value::as_bytes)
                            .ok_or_else(|| malformed("missing token"))?
                            .to_vec(),
                    },
                    _ => return Err(malformed("unknown method")),
                };
                Ok(Self::query(transaction, sender, query))
            }
            "r" => {
                let r = value.get("r").ok_or_else(|| malformed("response without body"))?;
                let sender = sender_id(r)?;
                let nodes_raw = r.get("nodes").and_then(Value::as_bytes).unwrap_or_default().to_vec();
                let values = r
                    .get("values")
                    .and_then(Value::as_list)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Value::as_bytes)
                    .filter_map(|b| parse_compact_peers(b).ok())
                    .flatten()
                    .collect();
                let reply = Reply {
                    nodes: decode_compact_nodes(&nodes_raw),
                    values,
                    token: r.get("token").and_then(Value::as_bytes).map(<[u8]>::to_vec),
                    nodes_raw,
                };
                Ok(Self::response(transaction, sender, reply))
            }
            "e" => {
                let list = value.get("e").and_then(Value::as_list).unwrap_or_default();
                let code = list.first().and_then(Value::as_int).unwrap_or(0);
                let message = list.get(1).and_then(Value::as_str).unwrap_or_default();
                Ok(Self {
                    transaction,
                    sender: None,
                    body: Body::Error { code, message },
                })
            }
            _ => Err(malformed("unknown message type")),
        }
    }
}

fn sender_id(dict: &Value) -> Result<NodeId> {
    dict.get("id")
        .and_then(Value::as_bytes)
        .and_then(NodeId::from_slice)
        .ok_or_else(|| malformed("missing node id"))
}
