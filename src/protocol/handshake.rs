//! BitTorrent handshake protocol
//!
//! Handles the fixed 68-byte handshake exchanged before any message.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved byte carrying the extension protocol bit
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Client prefix of generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-SC0100-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved bytes (feature bits)
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Create a handshake advertising the extension protocol
    pub fn with_extension_protocol(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut hs = Self::new(info_hash, peer_id);
        hs.reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        hs
    }

    /// Whether the sender supports the extension protocol
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LEN {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::protocol_violation_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH {
            error!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, data[0]);
            return Err(TorrentError::protocol_violation_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, data[0]),
            )
            .into());
        }

        if &data[1..20] != PROTOCOL_STRING {
            error!("Invalid protocol string");
            return Err(TorrentError::protocol_violation("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake info_hash: {}, peer_id: {}, reserved: {}",
            hex::encode(info_hash),
            hex::encode(peer_id),
            hex::encode(reserved)
        );
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake against the expected info hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if self.info_hash != *expected_info_hash {
            error!(
                "Info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return Err(TorrentError::protocol_violation("Info hash mismatch").into());
        }
        Ok(())
    }

    /// Client name decoded from an Azureus-style peer id, if any
    pub fn client_name(peer_id: &[u8; 20]) -> String {
        if peer_id[0] == b'-' && peer_id[7] == b'-' {
            let code = String::from_utf8_lossy(&peer_id[1..3]);
            let version = String::from_utf8_lossy(&peer_id[3..7]);
            format!("{} {}", code, version)
        } else {
            String::from("unknown")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let hs = Handshake::with_extension_protocol([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[25], 0x10);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_deserialize() {
        let hs = Handshake::with_extension_protocol([3u8; 20], [4u8; 20]);
        let parsed = Handshake::deserialize(&hs.serialize()).unwrap();
        assert_eq!(parsed, hs);
        assert!(parsed.supports_extension_protocol());
        assert!(!Handshake::new([0; 20], [0; 20]).supports_extension_protocol());
    }

    #[test]
    fn test_rejects_wrong_protocol() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[5] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
        bytes[0] = 18;
        assert!(Handshake::deserialize(&bytes).is_err());
        assert!(Handshake::deserialize(&bytes[..40]).is_err());
    }

    #[test]
    fn test_validate() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate(&[1u8; 20]).is_ok());
        assert!(hs.validate(&[9u8; 20]).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let id = Handshake::generate_peer_id();
        assert_eq!(&id[..8], PEER_ID_PREFIX);
        assert_ne!(id, Handshake::generate_peer_id());
        assert_eq!(Handshake::client_name(&id), "SC 0100");
    }
}
