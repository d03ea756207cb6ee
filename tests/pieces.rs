//! Piece math at content-length boundaries and descriptor persistence

use swarmcore::{TorrentBuilder, TorrentInfo, TorrentParser};
use tempfile::TempDir;

fn build(len: usize) -> TorrentInfo {
    TorrentBuilder::from_memory("edge.bin", vec![0xAB; len], 10).build().unwrap()
}

#[test]
fn test_length_99_piece_10() {
    let info = build(99);
    assert_eq!(info.piece_count(), 10);
    assert_eq!(info.last_piece_length(), 9);
    let window = info.file_window(0).unwrap();
    assert_eq!(window.first_piece, 0);
    assert_eq!(window.last_piece, 9);
}

#[test]
fn test_length_100_piece_10() {
    let info = build(100);
    assert_eq!(info.piece_count(), 10);
    assert_eq!(info.last_piece_length(), 10);
}

#[test]
fn test_length_101_piece_10() {
    let info = build(101);
    assert_eq!(info.piece_count(), 11);
    assert_eq!(info.last_piece_length(), 1);
}

#[test]
fn test_shorter_than_one_piece() {
    let info = build(7);
    assert_eq!(info.piece_count(), 1);
    let window = info.file_window(0).unwrap();
    assert_eq!((window.first_piece, window.last_piece), (0, 0));
}

#[test]
fn test_saved_descriptor_keeps_info_hash() {
    let dir = TempDir::new().unwrap();
    let info = TorrentBuilder::from_memory_files(
        "album",
        vec![
            (vec!["cd1".into(), "01.flac".into()], vec![1; 300]),
            (vec!["cd1".into(), "02.flac".into()], vec![2; 17]),
        ],
        64,
    )
    .announce("http://tracker.invalid/announce")
    .comment("loopback")
    .build()
    .unwrap();
    let path = dir.path().join("album.torrent");
    info.save(&path).unwrap();

    let read = TorrentParser::parse_file(&path).unwrap();
    assert_eq!(read.info_hash, info.info_hash);
    assert_eq!(read.to_bytes(), std::fs::read(&path).unwrap());
    assert_eq!(read.files.len(), 2);
    assert_eq!(read.total_size(), 317);
}
