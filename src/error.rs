//! Error types for the download engine
//!
//! This module defines the error taxonomy shared by every layer of the
//! engine, from descriptor parsing up to the session supervisor.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse classification of a [`TorrentError`].
///
/// Kinds are what state snapshots, the per-handle log ring and the CLI exit
/// codes work with; the full error carries the human-readable details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedDescriptor,
    DuplicateDownload,
    OperationNotPossibleAtRuntime,
    OperationNotEnabledByConfiguration,
    IoError,
    HashMismatch,
    TrackerUnreachable,
    ProtocolViolation,
    ConfigurationInvalid,
    StateCorruption,
    NetworkError,
}

impl ErrorKind {
    /// Classify an `anyhow::Error` by looking for a `TorrentError` in its chain.
    ///
    /// Plain I/O errors are reported as `IoError`; anything else unknown is
    /// treated as a network failure since that is where foreign errors come from.
    pub fn of(err: &anyhow::Error) -> ErrorKind {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<TorrentError>() {
                return e.kind();
            }
            if cause.downcast_ref::<std::io::Error>().is_some() {
                return ErrorKind::IoError;
            }
        }
        ErrorKind::NetworkError
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MalformedDescriptor => "MalformedDescriptor",
            ErrorKind::DuplicateDownload => "DuplicateDownload",
            ErrorKind::OperationNotPossibleAtRuntime => "OperationNotPossibleAtRuntime",
            ErrorKind::OperationNotEnabledByConfiguration => "OperationNotEnabledByConfiguration",
            ErrorKind::IoError => "IOError",
            ErrorKind::HashMismatch => "HashMismatch",
            ErrorKind::TrackerUnreachable => "TrackerUnreachable",
            ErrorKind::ProtocolViolation => "ProtocolViolation",
            ErrorKind::ConfigurationInvalid => "ConfigurationInvalid",
            ErrorKind::StateCorruption => "StateCorruption",
            ErrorKind::NetworkError => "NetworkError",
        };
        f.write_str(name)
    }
}

/// Error type for every engine operation
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Invalid bencoding, bad hash length, unsafe paths
    MalformedDescriptor {
        message: String,
        source: Option<String>,
    },

    /// A download with the same info-hash is already registered
    DuplicateDownload {
        info_hash: String,
    },

    /// A setter was called on a started handle and needs stop/restart
    OperationNotPossibleAtRuntime {
        operation: String,
    },

    /// Feature disabled when the session was configured
    OperationNotEnabledByConfiguration {
        feature: String,
    },

    /// Disk allocation, read, write, rename, unlink
    IoError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// A completed piece did not match its descriptor hash
    HashMismatch {
        piece: u32,
        peer: Option<String>,
    },

    /// Every URL of every tier failed for one announce attempt
    TrackerUnreachable {
        message: String,
        url: Option<String>,
    },

    /// A peer sent a malformed or oversize message
    ProtocolViolation {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Port out of range, negative rate, etc.
    ConfigurationInvalid {
        message: String,
        field: Option<String>,
    },

    /// A checkpoint or config file exists but cannot be decoded
    StateCorruption {
        message: String,
        path: Option<String>,
    },

    /// Connect refused, timeouts, unreachable addresses
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },
}

impl TorrentError {
    /// Create a new MalformedDescriptor error
    pub fn malformed(message: impl Into<String>) -> Self {
        TorrentError::MalformedDescriptor {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new MalformedDescriptor error with source
    pub fn malformed_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::MalformedDescriptor {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new DuplicateDownload error
    pub fn duplicate_download(info_hash: &[u8; 20]) -> Self {
        TorrentError::DuplicateDownload {
            info_hash: hex::encode(info_hash),
        }
    }

    /// Create a new OperationNotPossibleAtRuntime error
    pub fn not_possible_at_runtime(operation: impl Into<String>) -> Self {
        TorrentError::OperationNotPossibleAtRuntime {
            operation: operation.into(),
        }
    }

    /// Create a new OperationNotEnabledByConfiguration error
    pub fn not_enabled(feature: impl Into<String>) -> Self {
        TorrentError::OperationNotEnabledByConfiguration {
            feature: feature.into(),
        }
    }

    /// Create a new IoError
    pub fn io_error(message: impl Into<String>) -> Self {
        TorrentError::IoError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new IoError with path
    pub fn io_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::IoError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new IoError with path and source
    pub fn io_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::IoError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new HashMismatch error
    pub fn hash_mismatch(piece: u32) -> Self {
        TorrentError::HashMismatch { piece, peer: None }
    }

    /// Create a new HashMismatch error attributed to a peer
    pub fn hash_mismatch_from(piece: u32, peer: impl Into<String>) -> Self {
        TorrentError::HashMismatch {
            piece,
            peer: Some(peer.into()),
        }
    }

    /// Create a new TrackerUnreachable error
    pub fn tracker_unreachable(message: impl Into<String>) -> Self {
        TorrentError::TrackerUnreachable {
            message: message.into(),
            url: None,
        }
    }

    /// Create a new TrackerUnreachable error with url
    pub fn tracker_unreachable_with_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::TrackerUnreachable {
            message: message.into(),
            url: Some(url.into()),
        }
    }

    /// Create a new ProtocolViolation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new ProtocolViolation error with source
    pub fn protocol_violation_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolViolation error with peer address
    pub fn protocol_violation_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new ConfigurationInvalid error
    pub fn config_invalid(message: impl Into<String>) -> Self {
        TorrentError::ConfigurationInvalid {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigurationInvalid error with field
    pub fn config_invalid_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigurationInvalid {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new StateCorruption error
    pub fn state_corruption(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StateCorruption {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// The coarse kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::MalformedDescriptor { .. } => ErrorKind::MalformedDescriptor,
            TorrentError::DuplicateDownload { .. } => ErrorKind::DuplicateDownload,
            TorrentError::OperationNotPossibleAtRuntime { .. } => ErrorKind::OperationNotPossibleAtRuntime,
            TorrentError::OperationNotEnabledByConfiguration { .. } => ErrorKind::OperationNotEnabledByConfiguration,
            TorrentError::IoError { .. } => ErrorKind::IoError,
            TorrentError::HashMismatch { .. } => ErrorKind::HashMismatch,
            TorrentError::TrackerUnreachable { .. } => ErrorKind::TrackerUnreachable,
            TorrentError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            TorrentError::ConfigurationInvalid { .. } => ErrorKind::ConfigurationInvalid,
            TorrentError::StateCorruption { .. } => ErrorKind::StateCorruption,
            TorrentError::NetworkError { .. } => ErrorKind::NetworkError,
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let chain = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::MalformedDescriptor { source, .. } => chain(source),
            TorrentError::IoError { source, .. } => chain(source),
            TorrentError::ProtocolViolation { source, .. } => chain(source),
            TorrentError::NetworkError { source, .. } => chain(source),
            TorrentError::TrackerUnreachable { url, .. } => chain(url),
            _ => {}
        }
        self
    }

    /// Recover the `TorrentError` carried by an `anyhow::Error`, or build one with `fallback`
    pub fn from_anyhow(err: anyhow::Error, fallback: impl FnOnce(String) -> TorrentError) -> Self {
        match err.downcast::<TorrentError>() {
            Ok(e) => e,
            Err(other) => fallback(format!("{:#}", other)),
        }
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::MalformedDescriptor { message, source } => {
                if let Some(src) = source {
                    write!(f, "Malformed descriptor: {} (source: {})", message, src)
                } else {
                    write!(f, "Malformed descriptor: {}", message)
                }
            }
            TorrentError::DuplicateDownload { info_hash } => {
                write!(f, "Duplicate download: {} is already present", info_hash)
            }
            TorrentError::OperationNotPossibleAtRuntime { operation } => {
                write!(f, "Operation not possible at runtime: {}", operation)
            }
            TorrentError::OperationNotEnabledByConfiguration { feature } => {
                write!(f, "Operation not enabled by configuration: {}", feature)
            }
            TorrentError::IoError { message, path, source } => match (path, source) {
                (Some(p), Some(s)) => write!(f, "I/O error: {} (path: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "I/O error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "I/O error: {} (source: {})", message, s),
                (None, None) => write!(f, "I/O error: {}", message),
            },
            TorrentError::HashMismatch { piece, peer } => match peer {
                Some(p) => write!(f, "Hash mismatch: piece {} (peer: {})", piece, p),
                None => write!(f, "Hash mismatch: piece {}", piece),
            },
            TorrentError::TrackerUnreachable { message, url } => match url {
                Some(u) => write!(f, "Tracker unreachable: {} (url: {})", message, u),
                None => write!(f, "Tracker unreachable: {}", message),
            },
            TorrentError::ProtocolViolation { message, peer, source } => match (peer, source) {
                (Some(p), Some(s)) => write!(f, "Protocol violation: {} (peer: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Protocol violation: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "Protocol violation: {} (source: {})", message, s),
                (None, None) => write!(f, "Protocol violation: {}", message),
            },
            TorrentError::ConfigurationInvalid { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Configuration invalid: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Configuration invalid: {}", message)
                }
            }
            TorrentError::StateCorruption { message, path } => {
                if let Some(p) = path {
                    write!(f, "State corruption: {} (path: {})", message, p)
                } else {
                    write!(f, "State corruption: {}", message)
                }
            }
            TorrentError::NetworkError { message, address, source } => match (address, source) {
                (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                (None, None) => write!(f, "Network error: {}", message),
            },
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::IoError {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::protocol_violation_with_source("Failed to decode bencoded payload", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::StateCorruption {
            message: format!("Failed to decode JSON state: {}", err),
            path: None,
        }
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}
