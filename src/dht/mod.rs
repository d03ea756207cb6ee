//! DHT (Distributed Hash Table) module
//!
//! Peer source sharing the session's UDP socket. Disabled unless the session
//! enables it.

#[allow(clippy::module_inception)]
pub mod dht;
pub mod message;
pub mod node;
pub mod routing;

pub use dht::{resolve_contacts, Dht};
pub use message::{Body, KrpcMessage, Query, Reply};
pub use node::{Node, NodeId};
pub use routing::RoutingTable;
