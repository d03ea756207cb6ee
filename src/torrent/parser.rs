//! Torrent file parser
//!
//! Handles parsing of .torrent files and validating the metadata dictionary
//! into a [`TorrentInfo`].

use std::path::Path;

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};
use crate::torrent::info::{TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data)
            .map_err(|e| TorrentError::malformed_with_source("Invalid bencoding", e.to_string()))?;
        Self::from_value(root)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::io_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    /// Validate a decoded metadata dictionary and finalize it
    pub fn from_value(root: Value) -> Result<TorrentInfo> {
        if root.as_dict().is_none() {
            return Err(TorrentError::malformed("Root must be a dictionary").into());
        }
        let info_value = root
            .get("info")
            .ok_or_else(|| TorrentError::malformed("Missing info dictionary"))?;
        if info_value.as_dict().is_none() {
            return Err(TorrentError::malformed("info must be a dictionary").into());
        }

        let info_hash = TorrentInfo::generate_info_hash(&info_value.encode());
        debug!("Info hash: {}", hex::encode(info_hash));

        let name = info_value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TorrentError::malformed("Missing name field"))?;
        check_component(&name)?;

        let piece_length = info_value
            .get("piece length")
            .and_then(Value::as_int)
            .ok_or_else(|| TorrentError::malformed("Missing piece length field"))?;
        if piece_length <= 0 {
            return Err(TorrentError::malformed(format!("Piece length must be positive, got {}", piece_length)).into());
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = info_value
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::malformed("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (files, multi_file) = match (info_value.get("length"), info_value.get("files")) {
            (Some(length), None) => {
                let length = non_negative(length, "length")?;
                let file = TorrentFile {
                    path: vec![name.clone()],
                    length,
                    offset: 0,
                    md5sum: info_value.get("md5sum").and_then(Value::as_str),
                    sha1: info_value.get("sha1").and_then(parse_sha1),
                    crc32: info_value.get("crc32").and_then(Value::as_str),
                };
                (vec![file], false)
            }
            (None, Some(list)) => (parse_files(list)?, true),
            (Some(_), Some(_)) => {
                return Err(TorrentError::malformed("Both length and files present in info").into());
            }
            (None, None) => {
                return Err(TorrentError::malformed("Missing length or files field").into());
            }
        };

        let total: u64 = files.iter().map(|f| f.length).sum();
        if total == 0 {
            return Err(TorrentError::malformed("Content length of 0 is not allowed").into());
        }
        let expected_pieces = total.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(TorrentError::malformed(format!(
                "Pieces field holds {} hashes but {} bytes at piece length {} need {}",
                pieces.len(),
                total,
                piece_length,
                expected_pieces
            ))
            .into());
        }

        let announce = root.get("announce").and_then(Value::as_str).map(|u| normalize_url(&u));
        let announce_list = parse_announce_list(root.get("announce-list"));
        let nodes = parse_nodes(root.get("nodes"));
        let http_seeds = root
            .get("httpseeds")
            .and_then(Value::as_list)
            .map(|l| l.iter().filter_map(Value::as_str).map(|u| normalize_url(&u)).collect())
            .unwrap_or_default();

        let info = TorrentInfo {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            multi_file,
            announce,
            announce_list,
            nodes,
            http_seeds,
            comment: root.get("comment").and_then(Value::as_str),
            created_by: root.get("created by").and_then(Value::as_str),
            creation_date: root.get("creation date").and_then(Value::as_int),
            encoding: root.get("encoding").and_then(Value::as_str),
            private: info_value.get("private").and_then(Value::as_int) == Some(1),
            meta: root,
        };

        info!(
            "Parsed torrent '{}': {} files, {} pieces of {} bytes, {} total",
            info.name,
            info.files.len(),
            info.pieces.len(),
            info.piece_length,
            total
        );
        Ok(info)
    }
}

/// Strip trailing slashes from a tracker URL
pub(crate) fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn non_negative(value: &Value, field: &str) -> Result<u64> {
    match value.as_int() {
        Some(n) if n >= 0 => Ok(n as u64),
        _ => Err(TorrentError::malformed(format!("{} must be a non-negative integer", field)).into()),
    }
}

fn parse_sha1(value: &Value) -> Option<[u8; 20]> {
    let bytes = value.as_bytes()?;
    match bytes.len() {
        20 => bytes.try_into().ok(),
        40 => hex::decode(bytes).ok().and_then(|v| v.try_into().ok()),
        _ => None,
    }
}

/// A path component must be non-empty, not `.`/`..` and free of separators
pub(crate) fn check_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0')
        || (component.len() >= 2 && component.as_bytes()[1] == b':')
    {
        return Err(TorrentError::malformed(format!("Unsafe path component: {:?}", component)).into());
    }
    Ok(())
}

fn parse_files(list: &Value) -> Result<Vec<TorrentFile>> {
    let entries = list
        .as_list()
        .ok_or_else(|| TorrentError::malformed("files must be a list"))?;
    if entries.is_empty() {
        return Err(TorrentError::malformed("files list is empty").into());
    }

    let mut files = Vec::with_capacity(entries.len());
    let mut offset = 0u64;
    for entry in entries {
        let length = non_negative(
            entry
                .get("length")
                .ok_or_else(|| TorrentError::malformed("File entry missing length"))?,
            "length",
        )?;
        let path: Vec<String> = entry
            .get("path")
            .and_then(Value::as_list)
            .ok_or_else(|| TorrentError::malformed("File entry missing path"))?
            .iter()
            .map(|c| c.as_str().ok_or_else(|| TorrentError::malformed("Path component is not a string")))
            .collect::<std::result::Result<_, _>>()?;
        if path.is_empty() {
            return Err(TorrentError::malformed("File entry has an empty path").into());
        }
        for component in &path {
            check_component(component)?;
        }

        let end = offset
            .checked_add(length)
            .ok_or_else(|| TorrentError::malformed("Total content length overflows"))?;
        files.push(TorrentFile {
            path,
            length,
            offset,
            md5sum: entry.get("md5sum").and_then(Value::as_str),
            sha1: entry.get("sha1").and_then(parse_sha1),
            crc32: entry.get("crc32").and_then(Value::as_str),
        });
        offset = end;
    }
    Ok(files)
}

fn parse_announce_list(value: Option<&Value>) -> Vec<Vec<String>> {
    let Some(tiers) = value.and_then(Value::as_list) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (i, tier) in tiers.iter().enumerate() {
        let urls: Vec<String> = tier
            .as_list()
            .map(|l| l.iter().filter_map(Value::as_str).map(|u| normalize_url(&u)).collect())
            .unwrap_or_default();
        if urls.is_empty() {
            warn!("Dropping empty announce tier {}", i);
            continue;
        }
        out.push(urls);
    }
    out
}

fn parse_nodes(value: Option<&Value>) -> Vec<(String, u16)> {
    value
        .and_then(Value::as_list)
        .map(|l| {
            l.iter()
                .filter_map(|n| {
                    let pair = n.as_list()?;
                    let host = pair.first()?.as_str()?;
                    let port = pair.get(1)?.as_int()?;
                    u16::try_from(port).ok().map(|p| (host, p))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::bencode::DictBuilder;

    fn info_dict(length: i64, piece_length: i64, pieces: usize) -> Value {
        DictBuilder::new()
            .insert("length", Value::Int(length))
            .insert("name", Value::string("file.bin"))
            .insert("piece length", Value::Int(piece_length))
            .insert("pieces", Value::bytes(vec![0u8; 20 * pieces]))
            .build()
    }

    fn root(info: Value) -> Value {
        DictBuilder::new()
            .insert("announce", Value::string("http://tracker.example.com/announce/"))
            .insert("info", info)
            .build()
    }

    #[test]
    fn test_parse_single_file() {
        let data = root(info_dict(99, 10, 10)).encode();
        let info = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(info.name, "file.bin");
        assert_eq!(info.total_size(), 99);
        assert_eq!(info.files.len(), 1);
        assert!(!info.is_multi_file());
        assert_eq!(info.announce.as_deref(), Some("http://tracker.example.com/announce"));
    }

    #[test]
    fn test_info_hash_is_sha1_of_info() {
        let info_value = info_dict(100, 10, 10);
        let expected = TorrentInfo::generate_info_hash(&info_value.encode());
        let info = TorrentParser::parse_bytes(&root(info_value).encode()).unwrap();
        assert_eq!(info.info_hash, expected);
    }

    #[test]
    fn test_rejects_bad_piece_count() {
        let data = root(info_dict(99, 10, 9)).encode();
        let err = TorrentParser::parse_bytes(&data).unwrap_err();
        assert_eq!(crate::error::ErrorKind::of(&err), crate::error::ErrorKind::MalformedDescriptor);
    }

    #[test]
    fn test_rejects_zero_length() {
        assert!(TorrentParser::parse_bytes(&root(info_dict(0, 10, 0)).encode()).is_err());
    }

    #[test]
    fn test_rejects_non_positive_piece_length() {
        assert!(TorrentParser::parse_bytes(&root(info_dict(10, 0, 1)).encode()).is_err());
    }

    #[test]
    fn test_rejects_info_not_dict() {
        let data = DictBuilder::new().insert("info", Value::Int(1)).build().encode();
        assert!(TorrentParser::parse_bytes(&data).is_err());
    }

    #[test]
    fn test_rejects_unsafe_paths() {
        for bad in [vec![".."], vec!["a", ".."], vec![""], vec!["/etc"], vec!["C:evil"]] {
            let files = Value::List(vec![DictBuilder::new()
                .insert("length", Value::Int(5))
                .insert("path", Value::List(bad.iter().map(|c| Value::string(c)).collect()))
                .build()]);
            let info = DictBuilder::new()
                .insert("files", files)
                .insert("name", Value::string("dir"))
                .insert("piece length", Value::Int(16))
                .insert("pieces", Value::bytes(vec![0u8; 20]))
                .build();
            assert!(TorrentParser::parse_bytes(&root(info).encode()).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_rejects_overflowing_total_length() {
        let file = |name: &str| {
            DictBuilder::new()
                .insert("length", Value::Int(i64::MAX))
                .insert("path", Value::List(vec![Value::string(name)]))
                .build()
        };
        let info = DictBuilder::new()
            .insert("files", Value::List(vec![file("a"), file("b"), file("c")]))
            .insert("name", Value::string("huge"))
            .insert("piece length", Value::Int(16))
            .insert("pieces", Value::bytes(vec![0u8; 20]))
            .build();
        let err = TorrentParser::parse_bytes(&root(info).encode()).unwrap_err();
        assert_eq!(crate::error::ErrorKind::of(&err), crate::error::ErrorKind::MalformedDescriptor);
    }

    #[test]
    fn test_announce_list_tiers() {
        let data = DictBuilder::new()
            .insert(
                "announce-list",
                Value::List(vec![
                    Value::List(vec![Value::string("udp://a:1/"), Value::string("http://b/announce")]),
                    Value::List(vec![]),
                    Value::List(vec![Value::string("http://c/announce")]),
                ]),
            )
            .insert("info", info_dict(10, 10, 1))
            .build()
            .encode();
        let info = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(info.announce_list.len(), 2);
        assert_eq!(info.announce_list[0][0], "udp://a:1");
        assert_eq!(info.tracker_tiers().len(), 2);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let data = DictBuilder::new()
            .insert("info", info_dict(10, 10, 1))
            .insert("x-custom", Value::string("kept"))
            .build()
            .encode();
        let info = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(info.to_bytes(), data);
    }

    #[test]
    fn test_nodes() {
        let data = DictBuilder::new()
            .insert("info", info_dict(10, 10, 1))
            .insert(
                "nodes",
                Value::List(vec![Value::List(vec![Value::string("router.example"), Value::Int(6881)])]),
            )
            .build()
            .encode();
        let info = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(info.nodes, vec![("router.example".to_string(), 6881)]);
    }
}
