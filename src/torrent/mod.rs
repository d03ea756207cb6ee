//! Torrent descriptor module
//!
//! Bencode codec, descriptor parsing and validation, and descriptor creation.

pub mod bencode;
pub mod builder;
pub mod info;
pub mod parser;

pub use builder::TorrentBuilder;
pub use info::{FileSpan, FileWindow, TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
