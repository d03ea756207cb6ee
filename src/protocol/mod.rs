//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol and the extension protocol.

pub mod bitfield;
pub mod extension;
pub mod handshake;
pub mod message;
pub mod wire;

pub use bitfield::Bitfield;
pub use extension::{ExtensionHandshake, PexMessage};
pub use handshake::{Handshake, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId, MAX_MESSAGE_LEN};
pub use wire::{BitTorrentWire, WireProtocol};
