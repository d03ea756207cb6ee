//! Upload slots, snubbing and super-seeding as seen by a peer on the wire

mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use common::{local_addr, random_bytes, seeder_with, session_config, GRACE, WAIT};
use swarmcore::protocol::{BitTorrentWire, WireProtocol};
use swarmcore::{Bitfield, DownloadConfig, Handshake, Message, Session, TorrentBuilder, TorrentInfo};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};

struct RawPeer {
    sock: TcpStream,
    wire: BitTorrentWire,
}

impl RawPeer {
    async fn connect(addr: SocketAddr, info_hash: [u8; 20]) -> Self {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut wire = BitTorrentWire::default();
        let ours = Handshake::new(info_hash, Handshake::generate_peer_id());
        wire.write_handshake(&mut sock, &ours).await.unwrap();
        let theirs = wire.read_handshake(&mut sock).await.unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        Self { sock, wire }
    }

    async fn accept(listener: &TcpListener, info_hash: [u8; 20]) -> Self {
        let (mut sock, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut wire = BitTorrentWire::default();
        let theirs = wire.read_handshake(&mut sock).await.unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        let ours = Handshake::new(info_hash, Handshake::generate_peer_id());
        wire.write_handshake(&mut sock, &ours).await.unwrap();
        Self { sock, wire }
    }

    async fn send(&mut self, message: Message) {
        self.wire.write_message(&mut self.sock, &message).await.unwrap();
    }

    async fn next(&mut self) -> Message {
        loop {
            let (message, _) = tokio::time::timeout(WAIT, self.wire.read_message(&mut self.sock))
                .await
                .unwrap()
                .unwrap();
            if message != Message::KeepAlive {
                return message;
            }
        }
    }

    /// Read until `matches` accepts a message and return it
    async fn until(&mut self, matches: impl Fn(&Message) -> bool) -> Message {
        loop {
            let message = self.next().await;
            if matches(&message) {
                return message;
            }
        }
    }
}

fn descriptor(data: &[u8]) -> TorrentInfo {
    TorrentBuilder::from_memory("slots.bin", data.to_vec(), 16_384).build().unwrap()
}

#[tokio::test]
async fn test_upload_slot_moves_to_interested_peer_on_round() {
    let dir = TempDir::new().unwrap();
    let data = random_bytes(100_000);
    let info = descriptor(&data);
    let (session, handle) = seeder_with(dir.path(), &info, &data, 0, |config| {
        config.max_uploads = 1;
        config.min_uploads = 0;
        config.round_robin_period_secs = 1;
    })
    .await;
    let addr = local_addr(&session);

    let mut first = RawPeer::connect(addr, info.info_hash).await;
    let mut second = RawPeer::connect(addr, info.info_hash).await;
    handle.wait_for(|s| s.peer_count == 2, WAIT).await.unwrap();
    assert!(matches!(first.next().await, Message::Bitfield { .. }));
    assert!(matches!(second.next().await, Message::Bitfield { .. }));

    first.send(Message::Interested).await;
    assert_eq!(first.until(|m| *m == Message::Unchoke).await, Message::Unchoke);

    // The only slot is taken, so the second peer waits for a periodic round
    first.send(Message::NotInterested).await;
    second.send(Message::Interested).await;
    let begun = Instant::now();
    assert_eq!(second.until(|m| *m == Message::Unchoke).await, Message::Unchoke);
    assert!(begun.elapsed() < Duration::from_secs(5));
    assert_eq!(first.until(|m| *m == Message::Choke).await, Message::Choke);

    session.shutdown(GRACE).await;
}

#[tokio::test]
async fn test_silent_peer_is_snubbed_and_requests_cancelled() {
    let dir = TempDir::new().unwrap();
    let data = random_bytes(100_000);
    let info = descriptor(&data);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let session = Session::start(session_config(&dir.path().join("state"))).await.unwrap();
    let mut config = DownloadConfig::new(dir.path().join("content"));
    config.snub_time_secs = 1;
    let handle = session.add(info.clone(), config).await.unwrap();
    handle.add_peer(listener.local_addr().unwrap());

    let mut peer = RawPeer::accept(&listener, info.info_hash).await;
    let full = Bitfield::full(info.piece_count());
    peer.send(Message::Bitfield {
        bitfield: full.as_bytes().to_vec(),
    })
    .await;
    peer.send(Message::Unchoke).await;

    let request = peer.until(|m| matches!(m, Message::Request { .. })).await;
    assert!(matches!(request, Message::Request { index, .. } if index < info.piece_count()));
    // Never answer; after the snub time the outstanding requests are cancelled
    let cancel = peer.until(|m| matches!(m, Message::Cancel { .. })).await;
    assert!(matches!(cancel, Message::Cancel { index, .. } if index < info.piece_count()));

    let state = handle.snapshot(true).await.unwrap();
    let peers = state.peers.unwrap();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].flags.snubbed);
    assert_eq!(state.progress, 0.0);

    session.shutdown(GRACE).await;
}

#[tokio::test]
async fn test_super_seeder_offers_one_piece_at_a_time() {
    let dir = TempDir::new().unwrap();
    let data = random_bytes(100_000);
    let info = descriptor(&data);
    let (session, _handle) = seeder_with(dir.path(), &info, &data, 0, |config| {
        config.super_seeder = true;
    })
    .await;
    let addr = local_addr(&session);

    let mut first = RawPeer::connect(addr, info.info_hash).await;
    let Message::Have { piece_index: offered } = first.next().await else {
        panic!("super-seeder must open with a single have");
    };
    assert!(offered < info.piece_count());

    // Nothing new until the offer is taken up
    first.send(Message::Interested).await;
    first.send(Message::Have { piece_index: offered }).await;
    let Message::Have { piece_index: next } = first.until(|m| matches!(m, Message::Have { .. })).await else {
        unreachable!();
    };
    assert_ne!(next, offered);

    let mut second = RawPeer::connect(addr, info.info_hash).await;
    let Message::Have { piece_index: other } = second.next().await else {
        panic!("super-seeder must open with a single have");
    };
    assert_ne!(other, offered);
    assert_ne!(other, next);

    session.shutdown(GRACE).await;
}
