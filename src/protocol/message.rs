//! BitTorrent protocol messages
//!
//! Defines all length-prefixed message types exchanged after the handshake.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;

/// Largest message body accepted from a peer: a 128 KiB block plus header
pub const MAX_MESSAGE_LEN: usize = 128 * 1024 + 13;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_violation_with_source("Invalid message ID", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// Extension protocol message; id 0 is the extension handshake
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::protocol_violation("Message shorter than its length prefix").into());
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 != length {
            return Err(TorrentError::protocol_violation_with_source(
                "Message length prefix mismatch",
                format!("prefix says {}, got {}", length, data.len() - 4),
            )
            .into());
        }
        Self::parse_body(&data[4..])
    }

    /// Parse a message body (the bytes after the length prefix)
    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }
        if body.len() > MAX_MESSAGE_LEN {
            return Err(TorrentError::protocol_violation_with_source(
                "Oversize message",
                format!("{} bytes, limit {}", body.len(), MAX_MESSAGE_LEN),
            )
            .into());
        }

        let mut buf = &body[1..];
        let message_id = MessageId::try_from(body[0])?;
        let exact = |want: usize, buf: &[u8]| -> Result<()> {
            if buf.len() != want {
                error!("{:?} message has {} payload bytes, expected {}", message_id, buf.len(), want);
                return Err(TorrentError::protocol_violation_with_source(
                    format!("Bad {:?} message length", message_id),
                    format!("expected {} bytes, got {}", want, buf.len()),
                )
                .into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => {
                exact(0, buf)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                exact(0, buf)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                exact(0, buf)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                exact(0, buf)?;
                Message::NotInterested
            }
            MessageId::Have => {
                exact(4, buf)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request | MessageId::Cancel => {
                exact(12, buf)?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let length = buf.get_u32();
                if message_id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if buf.len() < 8 {
                    return Err(TorrentError::protocol_violation_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", buf.len()),
                    )
                    .into());
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Port => {
                exact(2, buf)?;
                Message::Port { listen_port: buf.get_u16() }
            }
            MessageId::Extended => {
                if buf.is_empty() {
                    return Err(TorrentError::protocol_violation("Extended message without extension id").into());
                }
                let id = buf.get_u8();
                Message::Extended { id, payload: buf.to_vec() }
            }
        };
        trace!("Parsed message {:?}", message_id);
        Ok(message)
    }
}
