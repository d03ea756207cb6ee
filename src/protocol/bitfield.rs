//! Piece bitfield
//!
//! MSB-first packed bit per piece, the layout used on the wire and in resume data.

use anyhow::Result;

use crate::error::TorrentError;

/// A fixed-length set of piece bits
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bytes: Vec<u8>,
    len: u32,
}

impl Bitfield {
    /// All-zero bitfield for `len` pieces
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0u8; (len as usize).div_ceil(8)],
            len,
        }
    }

    /// All-one bitfield for `len` pieces
    pub fn full(len: u32) -> Self {
        let mut bf = Self::new(len);
        for i in 0..len {
            bf.set(i, true);
        }
        bf
    }

    /// Parse a received bitfield: the byte length must match and spare bits must be zero
    pub fn from_bytes(bytes: &[u8], len: u32) -> Result<Self> {
        let expected = (len as usize).div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_violation(format!(
                "Bitfield has {} bytes, expected {}",
                bytes.len(),
                expected
            ))
            .into());
        }
        let spare = (expected * 8) as u32 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::protocol_violation("Bitfield has spare bits set").into());
            }
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            len,
        })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bytes[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    pub fn set(&mut self, index: u32, value: bool) {
        if index >= self.len {
            return;
        }
        let byte = &mut self.bytes[(index / 8) as usize];
        let mask = 0x80 >> (index % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    pub fn all(&self) -> bool {
        self.count_ones() == self.len
    }

    pub fn none(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Indices of set bits
    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |i| self.get(*i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn from_hex(s: &str, len: u32) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| TorrentError::state_corruption(format!("Bad bitfield hex: {}", e), "resume"))?;
        Self::from_bytes(&bytes, len).map_err(|e| TorrentError::state_corruption(e.to_string(), "resume").into())
    }
}
