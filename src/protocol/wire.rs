//! Wire protocol utilities
//!
//! Async framing of handshakes and length-prefixed messages over a stream.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{trace, warn};

use super::handshake::HANDSHAKE_LEN;
use super::message::MAX_MESSAGE_LEN;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// WireProtocol trait for protocol utilities
pub trait WireProtocol {
    /// Read a complete message from the stream, returning it with its wire size
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<(Message, usize)>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
pub struct BitTorrentWire {
    /// Largest body accepted before the length prefix is rejected
    pub max_message_len: usize,
}

impl Default for BitTorrentWire {
    fn default() -> Self {
        Self {
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<(Message, usize)> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length == 0 {
            trace!("Received KeepAlive");
            return Ok((Message::KeepAlive, 4));
        }
        if length > self.max_message_len {
            warn!("Peer announced a {} byte message, limit {}", length, self.max_message_len);
            return Err(TorrentError::protocol_violation_with_source(
                "Oversize message",
                format!("{} bytes, limit {}", length, self.max_message_len),
            )
            .into());
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        Ok((Message::parse_body(&payload)?, 4 + length))
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf[..1]).await?;
        if buf[0] != super::PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_violation_with_source(
                "Invalid protocol length",
                format!("got {}", buf[0]),
            )
            .into());
        }
        reader.read_exact(&mut buf[1..]).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire::default();
        wire.write_message(&mut a, &Message::Have { piece_index: 7 }).await.unwrap();
        wire.write_message(&mut a, &Message::KeepAlive).await.unwrap();

        let (msg, size) = wire.read_message(&mut b).await.unwrap();
        assert_eq!(msg, Message::Have { piece_index: 7 });
        assert_eq!(size, 9);
        let (msg, _) = wire.read_message(&mut b).await.unwrap();
        assert_eq!(msg, Message::KeepAlive);
    }

    #[tokio::test]
    async fn test_oversize_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(10_000_000u32).to_be_bytes()).await.unwrap();
        let mut wire = BitTorrentWire::default();
        assert!(wire.read_message(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut wire = BitTorrentWire::default();
        let hs = Handshake::with_extension_protocol([5u8; 20], [6u8; 20]);
        wire.write_handshake(&mut a, &hs).await.unwrap();
        assert_eq!(wire.read_handshake(&mut b).await.unwrap(), hs);
    }
}
