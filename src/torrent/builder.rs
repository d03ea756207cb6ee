//! Torrent descriptor creation
//!
//! Walks input files, hashes them piece by piece and produces a finalized
//! [`TorrentInfo`]. Hashing can be cancelled and reports progress.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::torrent::bencode::{DictBuilder, Value};
use crate::torrent::info::TorrentInfo;
use crate::torrent::parser::{check_component, normalize_url, TorrentParser};

/// Progress callback, called with the fraction of bytes hashed
pub type ProgressFn = Box<dyn FnMut(f64) + Send>;

enum Source {
    Disk(PathBuf),
    Memory(Vec<u8>),
}

struct InputFile {
    path: Vec<String>,
    length: u64,
    source: Source,
}

/// Builder for new torrent descriptors
pub struct TorrentBuilder {
    name: String,
    multi_file: bool,
    inputs: Vec<InputFile>,
    piece_length: Option<u64>,
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    nodes: Vec<(String, u16)>,
    http_seeds: Vec<String>,
    comment: Option<String>,
    created_by: Option<String>,
    creation_date: Option<i64>,
    private: bool,
    file_sha1: bool,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressFn>,
}

impl TorrentBuilder {
    fn empty(name: String, multi_file: bool, inputs: Vec<InputFile>) -> Self {
        Self {
            name,
            multi_file,
            inputs,
            piece_length: None,
            announce: None,
            announce_list: Vec::new(),
            nodes: Vec::new(),
            http_seeds: Vec::new(),
            comment: None,
            created_by: Some(concat!("swarmcore/", env!("CARGO_PKG_VERSION")).to_string()),
            creation_date: None,
            private: false,
            file_sha1: false,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Start from a file or a directory on disk.
    ///
    /// Directories are walked recursively in sorted order.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TorrentError::malformed(format!("Path has no file name: {}", path.display())))?;
        check_component(&name)?;

        let meta = std::fs::metadata(path)
            .map_err(|e| TorrentError::io_error_full("Failed to stat input", path.display().to_string(), e.to_string()))?;
        if meta.is_file() {
            let input = InputFile {
                path: vec![name.clone()],
                length: meta.len(),
                source: Source::Disk(path.to_path_buf()),
            };
            return Ok(Self::empty(name, false, vec![input]));
        }

        let mut inputs = Vec::new();
        walk(path, &mut Vec::new(), &mut inputs)?;
        if inputs.is_empty() {
            return Err(TorrentError::malformed(format!("Directory {} has no files", path.display())).into());
        }
        debug!("Collected {} files under {}", inputs.len(), path.display());
        Ok(Self::empty(name, true, inputs))
    }

    /// Single-file torrent over in-memory content
    pub fn from_memory(name: &str, data: Vec<u8>, piece_length: u64) -> Self {
        let input = InputFile {
            path: vec![name.to_string()],
            length: data.len() as u64,
            source: Source::Memory(data),
        };
        let mut builder = Self::empty(name.to_string(), false, vec![input]);
        builder.piece_length = Some(piece_length);
        builder
    }

    /// Multi-file torrent over in-memory content
    pub fn from_memory_files(name: &str, files: Vec<(Vec<String>, Vec<u8>)>, piece_length: u64) -> Self {
        let inputs = files
            .into_iter()
            .map(|(path, data)| InputFile {
                path,
                length: data.len() as u64,
                source: Source::Memory(data),
            })
            .collect();
        let mut builder = Self::empty(name.to_string(), true, inputs);
        builder.piece_length = Some(piece_length);
        builder
    }

    pub fn piece_length(mut self, piece_length: u64) -> Self {
        self.piece_length = Some(piece_length);
        self
    }

    pub fn announce(mut self, url: &str) -> Self {
        self.announce = Some(normalize_url(url));
        self
    }

    /// Set the tiered announce list; every tier must be non-empty
    pub fn announce_list(mut self, tiers: Vec<Vec<String>>) -> Result<Self> {
        if tiers.iter().any(Vec::is_empty) {
            return Err(TorrentError::malformed("announce-list tiers must be non-empty").into());
        }
        self.announce_list = tiers
            .into_iter()
            .map(|tier| tier.iter().map(|u| normalize_url(u)).collect())
            .collect();
        Ok(self)
    }

    pub fn nodes(mut self, nodes: Vec<(String, u16)>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn http_seeds(mut self, seeds: Vec<String>) -> Self {
        self.http_seeds = seeds.iter().map(|u| normalize_url(u)).collect();
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn created_by(mut self, created_by: &str) -> Self {
        self.created_by = Some(created_by.to_string());
        self
    }

    pub fn creation_date(mut self, timestamp: i64) -> Self {
        self.creation_date = Some(timestamp);
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Also record an end-to-end SHA-1 per file
    pub fn with_file_sha1(mut self, enabled: bool) -> Self {
        self.file_sha1 = enabled;
        self
    }

    pub fn on_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Flag that aborts hashing when set
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Finalize on the blocking worker pool
    pub async fn build_async(self) -> Result<TorrentInfo> {
        tokio::task::spawn_blocking(move || self.build())
            .await
            .map_err(|e| TorrentError::io_error(format!("Hashing task failed: {}", e)))?
    }

    /// Hash all input and produce the finalized descriptor
    pub fn build(mut self) -> Result<TorrentInfo> {
        let total: u64 = self.inputs.iter().map(|f| f.length).sum();
        if total == 0 {
            return Err(TorrentError::malformed("Content length of 0 is not allowed").into());
        }
        let piece_length = self.piece_length.unwrap_or_else(|| default_piece_length(total));
        if piece_length == 0 {
            return Err(TorrentError::malformed("Piece length must be positive").into());
        }
        for input in &self.inputs {
            for component in &input.path {
                check_component(component)?;
            }
        }

        info!(
            "Hashing {} files ({} bytes) with piece length {}",
            self.inputs.len(),
            total,
            piece_length
        );

        let mut pieces = Vec::with_capacity((total.div_ceil(piece_length) * 20) as usize);
        let mut piece_hasher = Sha1::new();
        let mut in_piece = 0u64;
        let mut hashed = 0u64;
        let mut file_hashes = Vec::with_capacity(self.inputs.len());
        let mut buf = vec![0u8; 64 * 1024];

        for input in &self.inputs {
            let mut file_hasher = Sha1::new();
            let mut reader: Box<dyn Read + '_> = match &input.source {
                Source::Disk(path) => Box::new(File::open(path).map_err(|e| {
                    TorrentError::io_error_full("Failed to open input", path.display().to_string(), e.to_string())
                })?),
                Source::Memory(data) => Box::new(&data[..]),
            };
            let mut remaining = input.length;
            while remaining > 0 {
                if self.cancel.load(Ordering::Relaxed) {
                    warn!("Descriptor creation cancelled after {} bytes", hashed);
                    return Err(TorrentError::io_error("Descriptor creation cancelled").into());
                }
                let want = (piece_length - in_piece).min(remaining).min(buf.len() as u64) as usize;
                let n = reader.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(TorrentError::io_error(format!(
                        "Input {} shrank while hashing",
                        input.path.join("/")
                    ))
                    .into());
                }
                piece_hasher.update(&buf[..n]);
                if self.file_sha1 {
                    file_hasher.update(&buf[..n]);
                }
                in_piece += n as u64;
                remaining -= n as u64;
                hashed += n as u64;
                if in_piece == piece_length {
                    pieces.extend_from_slice(&piece_hasher.finalize_reset());
                    in_piece = 0;
                    if let Some(progress) = self.progress.as_mut() {
                        progress(hashed as f64 / total as f64);
                    }
                }
            }
            file_hashes.push(self.file_sha1.then(|| file_hasher.finalize().to_vec()));
        }
        if in_piece > 0 {
            pieces.extend_from_slice(&piece_hasher.finalize_reset());
        }
        if let Some(progress) = self.progress.as_mut() {
            progress(1.0);
        }

        let mut info = DictBuilder::new()
            .insert("name", Value::string(&self.name))
            .insert("piece length", Value::Int(piece_length as i64))
            .insert("pieces", Value::Bytes(pieces));
        if self.private {
            info = info.insert("private", Value::Int(1));
        }
        if self.multi_file {
            let files = self
                .inputs
                .iter()
                .zip(file_hashes)
                .map(|(input, sha1)| {
                    DictBuilder::new()
                        .insert("length", Value::Int(input.length as i64))
                        .insert("path", Value::List(input.path.iter().map(|c| Value::string(c)).collect()))
                        .insert_opt("sha1", sha1.map(Value::Bytes))
                        .build()
                })
                .collect();
            info = info.insert("files", Value::List(files));
        } else {
            info = info
                .insert("length", Value::Int(total as i64))
                .insert_opt("sha1", file_hashes.into_iter().next().flatten().map(Value::Bytes));
        }

        let announce_list = (!self.announce_list.is_empty()).then(|| {
            Value::List(
                self.announce_list
                    .iter()
                    .map(|tier| Value::List(tier.iter().map(|u| Value::string(u)).collect()))
                    .collect(),
            )
        });
        let nodes = (!self.nodes.is_empty()).then(|| {
            Value::List(
                self.nodes
                    .iter()
                    .map(|(host, port)| Value::List(vec![Value::string(host), Value::Int(*port as i64)]))
                    .collect(),
            )
        });
        let http_seeds = (!self.http_seeds.is_empty())
            .then(|| Value::List(self.http_seeds.iter().map(|u| Value::string(u)).collect()));

        let root = DictBuilder::new()
            .insert("info", info.build())
            .insert_opt("announce", self.announce.as_deref().map(Value::string))
            .insert_opt("announce-list", announce_list)
            .insert_opt("nodes", nodes)
            .insert_opt("httpseeds", http_seeds)
            .insert_opt("comment", self.comment.as_deref().map(Value::string))
            .insert_opt("created by", self.created_by.as_deref().map(Value::string))
            .insert_opt("creation date", self.creation_date.map(Value::Int))
            .build();

        TorrentParser::from_value(root)
    }
}

/// Aim for roughly 1500 pieces, clamped to 16 KiB..4 MiB
fn default_piece_length(total: u64) -> u64 {
    let target = total / 1500;
    let mut piece_length = 16 * 1024;
    while piece_length < target && piece_length < 4 * 1024 * 1024 {
        piece_length *= 2;
    }
    piece_length
}

fn walk(dir: &Path, prefix: &mut Vec<String>, out: &mut Vec<InputFile>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| TorrentError::io_error_full("Failed to read directory", dir.display().to_string(), e.to_string()))?
        .collect::<std::result::Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.metadata()?;
        prefix.push(name);
        if meta.is_dir() {
            walk(&entry.path(), prefix, out)?;
        } else if meta.is_file() {
            out.push(InputFile {
                path: prefix.clone(),
                length: meta.len(),
                source: Source::Disk(entry.path()),
            });
        }
        prefix.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_piece_hashes_match_content() {
        let data: Vec<u8> = (0..25u8).collect();
        let info = TorrentBuilder::from_memory("f", data.clone(), 10).build().unwrap();
        assert_eq!(info.piece_count(), 3);
        let expected: [u8; 20] = Sha1::digest(&data[20..25]).into();
        assert_eq!(info.piece_hash(2), Some(expected));
    }

    #[test]
    fn test_rejects_empty_content() {
        assert!(TorrentBuilder::from_memory("f", vec![], 10).build().is_err());
    }

    #[test]
    fn test_rejects_empty_tier() {
        let result = TorrentBuilder::from_memory("f", vec![1], 10).announce_list(vec![vec![], vec!["http://a".into()]]);
        assert!(result.is_err());
    }

    #[test]
    fn test_metadata_fields() {
        let info = TorrentBuilder::from_memory("f", vec![1; 30], 16)
            .announce("http://tracker/announce/")
            .announce_list(vec![vec!["http://a/".into()], vec!["udp://b:80".into()]])
            .unwrap()
            .comment("hello")
            .creation_date(1_700_000_000)
            .http_seeds(vec!["http://seed/".into()])
            .private(true)
            .with_file_sha1(true)
            .build()
            .unwrap();
        assert_eq!(info.announce.as_deref(), Some("http://tracker/announce"));
        assert_eq!(info.announce_list, vec![vec!["http://a".to_string()], vec!["udp://b:80".to_string()]]);
        assert_eq!(info.comment.as_deref(), Some("hello"));
        assert_eq!(info.creation_date, Some(1_700_000_000));
        assert_eq!(info.http_seeds, vec!["http://seed".to_string()]);
        assert!(info.private);
        let expected: [u8; 20] = Sha1::digest([1u8; 30]).into();
        assert_eq!(info.files[0].sha1, Some(expected));
    }

    #[test]
    fn test_cancel() {
        let builder = TorrentBuilder::from_memory("f", vec![0; 100], 10);
        builder.cancel_flag().store(true, Ordering::Relaxed);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_progress_reaches_one() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        TorrentBuilder::from_memory("f", vec![0; 35], 10)
            .on_progress(Box::new(move |p| sink.lock().unwrap().push(p)))
            .build()
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_from_path_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("content");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("b.txt"), vec![2u8; 7]).unwrap();
        std::fs::write(root.join("sub").join("a.txt"), vec![1u8; 9]).unwrap();

        let info = TorrentBuilder::from_path(&root).unwrap().piece_length(4).build().unwrap();
        assert!(info.is_multi_file());
        assert_eq!(info.name, "content");
        assert_eq!(info.files[0].path, vec!["b.txt"]);
        assert_eq!(info.files[1].path, vec!["sub", "a.txt"]);
        assert_eq!(info.total_size(), 16);
        assert_eq!(info.piece_count(), 4);
    }

    #[tokio::test]
    async fn test_build_async() {
        let info = TorrentBuilder::from_memory("f", vec![3; 64], 16).build_async().await.unwrap();
        assert_eq!(info.piece_count(), 4);
    }

    #[test]
    fn test_default_piece_length() {
        assert_eq!(default_piece_length(1000), 16 * 1024);
        assert_eq!(default_piece_length(u64::MAX / 2), 4 * 1024 * 1024);
    }
}
