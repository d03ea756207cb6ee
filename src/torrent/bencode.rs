//! Bencode codec
//!
//! Strict decoder and canonical encoder for the bencode format used by
//! descriptors, tracker responses and DHT messages.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::trace;

use crate::error::TorrentError;

/// Maximum nesting of lists and dictionaries accepted by the decoder
pub const MAX_DEPTH: usize = 64;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string interpreted as UTF-8, lossy
    pub fn as_str(&self) -> Option<String> {
        self.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a key when this value is a dictionary
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(data.into())
    }

    pub fn string(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    /// Canonical encoding of this value
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                // BTreeMap iterates in byte-lexicographic key order
                out.push(b'd');
                for (k, v) in map {
                    out.extend_from_slice(k.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(k);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

/// Builder-style helper for dictionaries
#[derive(Debug, Default)]
pub struct DictBuilder {
    map: BTreeMap<Vec<u8>, Value>,
}

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: &str, value: Value) -> Self {
        self.map.insert(key.as_bytes().to_vec(), value);
        self
    }

    pub fn insert_opt(self, key: &str, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.insert(key, v),
            None => self,
        }
    }

    pub fn build(self) -> Value {
        Value::Dict(self.map)
    }
}

/// Decode a complete buffer, rejecting trailing data and non-canonical forms
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut idx = 0;
    let value = decode_value(data, &mut idx, 0)?;
    if idx != data.len() {
        return Err(TorrentError::malformed(format!(
            "Trailing data after bencode value: {} of {} bytes consumed",
            idx,
            data.len()
        ))
        .into());
    }
    trace!("Decoded {} bytes of bencode", data.len());
    Ok(value)
}

/// Decode one value starting at `idx`, returning the value and the end offset.
///
/// Used where a bencoded header is followed by raw bytes.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize)> {
    let mut idx = 0;
    let value = decode_value(data, &mut idx, 0)?;
    Ok((value, idx))
}

fn err(msg: impl Into<String>) -> anyhow::Error {
    TorrentError::malformed(msg).into()
}

fn decode_value(data: &[u8], idx: &mut usize, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(err("Bencode nesting too deep"));
    }
    let byte = *data.get(*idx).ok_or_else(|| err("Unexpected end of data"))?;

    match byte {
        b'i' => {
            *idx += 1;
            let end = data[*idx..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| err("Unterminated integer"))?
                + *idx;
            let digits = &data[*idx..end];
            validate_int(digits)?;
            let num_str = std::str::from_utf8(digits).map_err(|_| err("Integer is not ASCII"))?;
            let value: i64 = num_str.parse().map_err(|_| err(format!("Invalid integer: {}", num_str)))?;
            *idx = end + 1;
            Ok(Value::Int(value))
        }
        b'l' => {
            *idx += 1;
            let mut list = Vec::new();
            loop {
                match data.get(*idx) {
                    Some(b'e') => break,
                    Some(_) => list.push(decode_value(data, idx, depth + 1)?),
                    None => return Err(err("Unterminated list")),
                }
            }
            *idx += 1;
            Ok(Value::List(list))
        }
        b'd' => {
            *idx += 1;
            let mut dict = BTreeMap::new();
            let mut last_key: Option<Vec<u8>> = None;
            loop {
                match data.get(*idx) {
                    Some(b'e') => break,
                    Some(b'0'..=b'9') => {}
                    Some(_) => return Err(err("Dictionary key must be a byte string")),
                    None => return Err(err("Unterminated dictionary")),
                }
                let key = decode_string(data, idx)?;
                if let Some(prev) = &last_key {
                    if key <= *prev {
                        return Err(err("Dictionary keys are not sorted and unique"));
                    }
                }
                let value = decode_value(data, idx, depth + 1)?;
                last_key = Some(key.clone());
                dict.insert(key, value);
            }
            *idx += 1;
            Ok(Value::Dict(dict))
        }
        b'0'..=b'9' => Ok(Value::Bytes(decode_string(data, idx)?)),
        other => Err(err(format!("Unknown bencode type byte: 0x{:02x}", other))),
    }
}

fn decode_string(data: &[u8], idx: &mut usize) -> Result<Vec<u8>> {
    let colon = data[*idx..]
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| err("Unterminated string length"))?
        + *idx;
    let len_digits = &data[*idx..colon];
    if len_digits.is_empty() || !len_digits.iter().all(u8::is_ascii_digit) {
        return Err(err("Invalid string length"));
    }
    if len_digits.len() > 1 && len_digits[0] == b'0' {
        return Err(err("String length has a leading zero"));
    }
    let len_str = std::str::from_utf8(len_digits).map_err(|_| err("Invalid string length"))?;
    let length: usize = len_str.parse().map_err(|_| err("String length overflow"))?;
    let start = colon + 1;
    let end = start.checked_add(length).ok_or_else(|| err("String length overflow"))?;
    if end > data.len() {
        return Err(err(format!("String of {} bytes runs past end of data", length)));
    }
    *idx = end;
    Ok(data[start..end].to_vec())
}

fn validate_int(digits: &[u8]) -> Result<()> {
    let (neg, body) = match digits.first() {
        Some(b'-') => (true, &digits[1..]),
        _ => (false, digits),
    };
    if body.is_empty() || !body.iter().all(u8::is_ascii_digit) {
        return Err(err("Invalid integer"));
    }
    if body.len() > 1 && body[0] == b'0' {
        return Err(err("Integer has a leading zero"));
    }
    if neg && body == b"0" {
        return Err(err("Negative zero is not canonical"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(decode(b"4:spam").unwrap(), Value::string("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(vec![]));
    }

    #[test]
    fn test_decode_nested() {
        let v = decode(b"d3:bar4:spam3:fooli1ei2eee").unwrap();
        assert_eq!(v.get("bar").and_then(Value::as_str).as_deref(), Some("spam"));
        assert_eq!(v.get("foo").and_then(Value::as_list).map(|l| l.len()), Some(2));
    }

    #[test]
    fn test_rejects_non_canonical() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"03:abc").is_err());
        assert!(decode(b"d3:foo1:a3:bar1:be").is_err());
        assert!(decode(b"d3:foo1:a3:foo1:be").is_err());
        assert!(decode(b"i1ei2e").is_err());
        assert!(decode(b"5:abc").is_err());
        assert!(decode(b"l").is_err());
        assert!(decode(b"di1ei2ee").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_encode_sorts_keys() {
        let v = DictBuilder::new()
            .insert("zeta", Value::Int(1))
            .insert("alpha", Value::string("x"))
            .build();
        assert_eq!(v.encode(), b"d5:alpha1:x4:zetai1ee".to_vec());
    }

    #[test]
    fn test_canonical_input_reencodes_identically() {
        let input = b"d8:announce15:http://t/ann/xx4:infod6:lengthi99e4:name1:f12:piece lengthi10eee";
        let v = decode(input).unwrap();
        assert_eq!(v.encode(), input.to_vec());
    }

    #[test]
    fn test_decode_prefix() {
        let (v, end) = decode_prefix(b"d1:ai1eeRAW").unwrap();
        assert_eq!(v.get("a").and_then(Value::as_int), Some(1));
        assert_eq!(end, 8);
    }
}
