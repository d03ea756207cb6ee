//! Peer connection module
//!
//! One task per peer. The task performs the handshake, then runs a reader and
//! a writer over the split socket. Everything the reader sees is posted to
//! the download controller as a [`PeerEvent`]; the controller drives the
//! writer with [`PeerCommand`]s.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::error::TorrentError;
use crate::peer::state::{ConnState, SharedConnState};
use crate::protocol::extension::{HANDSHAKE_ID, LOCAL_UT_PEX_ID};
use crate::protocol::{BitTorrentWire, Bitfield, ExtensionHandshake, Handshake, Message, PexMessage, WireProtocol};
use crate::ratelimit::{Direction, PeerLimiter};

/// Initial send-queue watermark
pub const INITIAL_WATERMARK: usize = 64 * 1024;

/// Largest send-queue watermark
pub const MAX_WATERMARK: usize = 1024 * 1024;

/// Pieces withheld from a broken-up seed bitfield
const BREAKUP_WITHHELD: usize = 8;

/// Settings shared by every connection of one download
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub info_hash: [u8; 20],
    pub our_peer_id: [u8; 20],
    pub listen_port: u16,
    pub request_backlog: u32,
    /// Largest `request` length accepted from a peer
    pub max_slice_length: u32,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
    pub max_message_len: usize,
}

impl ConnectionConfig {
    /// A peer silent for this long is dropped
    pub fn idle_timeout(&self) -> Duration {
        self.keepalive_interval * 2 + Duration::from_secs(10)
    }
}

/// What the controller asks a connection to do
#[derive(Debug)]
pub enum PeerCommand {
    Send(Message),
    Close,
}

/// What a connection reports to the controller
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake done; the connection is running
    Ready { peer_id: [u8; 20], extensions: bool },
    /// Any message other than a block or an extension message
    Message(Message),
    Block { piece: u32, offset: u32, data: Vec<u8> },
    ExtensionHandshake(ExtensionHandshake),
    Pex(PexMessage),
    /// Bytes read off the wire, protocol overhead included
    Received { wire_bytes: usize },
    /// The connection is gone; `error` is None on a clean close
    Closed { error: Option<TorrentError> },
}

/// Sender half of the controller's peer-event channel
pub type PeerEventSender = mpsc::UnboundedSender<(SocketAddr, PeerEvent)>;

enum Origin {
    Outgoing,
    Incoming(TcpStream, Handshake),
}

/// Handle to a running peer connection
///
/// Dropping the handle closes the connection once queued messages are written.
#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<PeerCommand>,
    queued: Arc<AtomicUsize>,
    watermark: usize,
    state: SharedConnState,
    task: JoinHandle<()>,
}

impl PeerConnection {
    /// Dial `addr` and run the connection
    pub fn connect(
        addr: SocketAddr,
        config: Arc<ConnectionConfig>,
        limiter: PeerLimiter,
        events: PeerEventSender,
    ) -> Self {
        Self::spawn(addr, Origin::Outgoing, config, limiter, events)
    }

    /// Run an accepted connection whose handshake has already been read
    pub fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        remote: Handshake,
        config: Arc<ConnectionConfig>,
        limiter: PeerLimiter,
        events: PeerEventSender,
    ) -> Self {
        Self::spawn(addr, Origin::Incoming(stream, remote), config, limiter, events)
    }

    fn spawn(
        addr: SocketAddr,
        origin: Origin,
        config: Arc<ConnectionConfig>,
        limiter: PeerLimiter,
        events: PeerEventSender,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let task_queued = queued.clone();
        let state = SharedConnState::default();
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let result = drive(addr, origin, &config, limiter, &events, rx, task_queued, &task_state).await;
            task_state.advance(ConnState::Closing);
            let error = result.err().map(|e| {
                TorrentError::from_anyhow(e, |m| TorrentError::network_error_full("Connection failed", addr.to_string(), m))
            });
            match &error {
                Some(e) => debug!("Connection to {} closed: {}", addr, e),
                None => debug!("Connection to {} closed", addr),
            }
            let _ = events.send((addr, PeerEvent::Closed { error }));
        });
        Self {
            addr,
            tx,
            queued,
            watermark: INITIAL_WATERMARK,
            state,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    /// Queue a message; returns false once the connection is gone
    pub fn send(&self, message: Message) -> bool {
        let len = message.length() as usize + 4;
        self.queued.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(PeerCommand::Send(message)).is_err() {
            self.queued.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Bytes queued but not yet written to the socket
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// The send queue is above the watermark; uploads should wait
    pub fn is_saturated(&self) -> bool {
        self.queued_bytes() >= self.watermark
    }

    /// Double the watermark up to [`MAX_WATERMARK`]
    pub fn grow_watermark(&mut self) {
        let grown = (self.watermark * 2).min(MAX_WATERMARK);
        if grown != self.watermark {
            trace!("Send watermark for {} raised to {}", self.addr, grown);
            self.watermark = grown;
        }
    }

    /// Flush queued messages, then close; nothing more is read
    pub fn close(&self) {
        self.state.advance(ConnState::Closing);
        let _ = self.tx.send(PeerCommand::Close);
    }

    /// Drop the connection immediately
    pub fn abort(&self) {
        self.task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    addr: SocketAddr,
    origin: Origin,
    config: &ConnectionConfig,
    limiter: PeerLimiter,
    events: &PeerEventSender,
    rx: mpsc::UnboundedReceiver<PeerCommand>,
    queued: Arc<AtomicUsize>,
    state: &SharedConnState,
) -> Result<()> {
    let mut wire = BitTorrentWire {
        max_message_len: config.max_message_len,
    };
    let ours = Handshake::with_extension_protocol(config.info_hash, config.our_peer_id);
    let advance = |next: ConnState| -> Result<()> {
        if !state.advance(next) {
            return Err(TorrentError::network_error_with_address(
                format!("Connection is {:?}, cannot enter {:?}", state.get(), next),
                addr.to_string(),
            )
            .into());
        }
        trace!("{} -> {:?}", addr, next);
        Ok(())
    };

    let (mut stream, remote) = match origin {
        Origin::Outgoing => {
            let mut stream = timeout(config.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TorrentError::network_error_with_address("Connection timeout", addr.to_string()))?
                .map_err(|e| TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string()))?;
            wire.write_handshake(&mut stream, &ours).await?;
            advance(ConnState::HandshakeSent)?;
            let remote = timeout(config.connect_timeout, wire.read_handshake(&mut stream))
                .await
                .map_err(|_| TorrentError::network_error_with_address("Handshake timeout", addr.to_string()))??;
            (stream, remote)
        }
        Origin::Incoming(mut stream, remote) => {
            wire.write_handshake(&mut stream, &ours).await?;
            (stream, remote)
        }
    };
    remote
        .validate(&config.info_hash)
        .map_err(|e| TorrentError::protocol_violation_with_peer(e.to_string(), addr.to_string()))?;
    advance(ConnState::HandshakeReceived)?;

    // The controller sends our bitfield, then the extension handshake
    let extensions = remote.supports_extension_protocol();
    let _ = stream.set_nodelay(true);

    advance(ConnState::Running)?;
    info!("Peer {} running ({}, extensions: {})", addr, Handshake::client_name(&remote.peer_id), extensions);
    if events
        .send((addr, PeerEvent::Ready { peer_id: remote.peer_id, extensions }))
        .is_err()
    {
        return Ok(());
    }

    let (reader, writer) = stream.into_split();
    let mut write_task = tokio::spawn(write_loop(
        writer,
        rx,
        limiter.clone(),
        queued,
        config.keepalive_interval,
        config.max_message_len,
    ));
    let result = tokio::select! {
        r = read_loop(addr, reader, config, &limiter, events, state) => r,
        w = &mut write_task => match w {
            Ok(r) => r,
            Err(e) => Err(TorrentError::network_error_full("Writer task failed", addr.to_string(), e.to_string()).into()),
        },
    };
    write_task.abort();
    state.advance(ConnState::Closing);
    trace!("{} -> {:?}", addr, ConnState::Closing);
    result
}

/// Our extension handshake, sent after the bitfield
pub fn extension_handshake(config: &ConnectionConfig) -> Result<Message> {
    let payload = ExtensionHandshake::local(config.listen_port, config.request_backlog).encode()?;
    Ok(Message::Extended { id: HANDSHAKE_ID, payload })
}

async fn read_loop(
    addr: SocketAddr,
    mut reader: OwnedReadHalf,
    config: &ConnectionConfig,
    limiter: &PeerLimiter,
    events: &PeerEventSender,
    state: &SharedConnState,
) -> Result<()> {
    let mut wire = BitTorrentWire {
        max_message_len: config.max_message_len,
    };
    let peer = addr.to_string();
    // A bitfield is only valid before any other core message
    let mut bitfield_allowed = true;
    loop {
        let (message, wire_bytes) = match timeout(config.idle_timeout(), wire.read_message(&mut reader)).await {
            Err(_) => return Err(TorrentError::network_error_with_address("Peer idle too long", peer).into()),
            Ok(Err(e)) => {
                if let Some(te) = e.downcast_ref::<TorrentError>() {
                    return Err(te.clone().with_context(format!("from {}", peer)).into());
                }
                if let Some(io) = e.downcast_ref::<std::io::Error>() {
                    if io.kind() == std::io::ErrorKind::UnexpectedEof {
                        return Ok(());
                    }
                }
                return Err(e);
            }
            Ok(Ok(read)) => read,
        };
        limiter.acquire(Direction::Down, wire_bytes as u64).await;
        if !state.get().is_running() {
            trace!("Discarding {:?} from {} while {:?}", message.message_id(), peer, state.get());
            return Ok(());
        }

        match &message {
            Message::KeepAlive | Message::Extended { .. } => {}
            Message::Bitfield { .. } if bitfield_allowed => bitfield_allowed = false,
            Message::Bitfield { .. } => {
                return Err(TorrentError::protocol_violation_with_peer("Bitfield after other messages", peer).into());
            }
            _ => bitfield_allowed = false,
        }

        let event = match message {
            Message::KeepAlive => None,
            Message::Piece { index, begin, block } => Some(PeerEvent::Block {
                piece: index,
                offset: begin,
                data: block,
            }),
            Message::Request { length, .. } if length > config.max_slice_length => {
                return Err(TorrentError::protocol_violation_with_peer(
                    format!("Request for {} bytes exceeds {}", length, config.max_slice_length),
                    peer,
                )
                .into());
            }
            Message::Extended { id: HANDSHAKE_ID, payload } => {
                let hs = ExtensionHandshake::decode(&payload)
                    .map_err(|e| TorrentError::protocol_violation_with_peer(e.to_string(), peer.clone()))?;
                Some(PeerEvent::ExtensionHandshake(hs))
            }
            Message::Extended { id: LOCAL_UT_PEX_ID, payload } => {
                let pex = PexMessage::decode(&payload)
                    .map_err(|e| TorrentError::protocol_violation_with_peer(e.to_string(), peer.clone()))?;
                Some(PeerEvent::Pex(pex))
            }
            Message::Extended { id, .. } => {
                trace!("Ignoring extension message {} from {}", id, peer);
                None
            }
            other => Some(PeerEvent::Message(other)),
        };

        if events.send((addr, PeerEvent::Received { wire_bytes })).is_err() {
            return Ok(());
        }
        if let Some(event) = event {
            if events.send((addr, event)).is_err() {
                return Ok(());
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<PeerCommand>,
    limiter: PeerLimiter,
    queued: Arc<AtomicUsize>,
    keepalive: Duration,
    max_message_len: usize,
) -> Result<()> {
    let mut wire = BitTorrentWire { max_message_len };
    loop {
        let command = match timeout(keepalive, rx.recv()).await {
            Err(_) => {
                trace!("Sending keep-alive");
                wire.write_message(&mut writer, &Message::KeepAlive).await?;
                continue;
            }
            Ok(None) => return Ok(()),
            Ok(Some(command)) => command,
        };
        match command {
            PeerCommand::Send(message) => {
                let len = message.length() as usize + 4;
                limiter.acquire(Direction::Up, len as u64).await;
                let result = wire.write_message(&mut writer, &message).await;
                queued.fetch_sub(len, Ordering::SeqCst);
                result?;
            }
            PeerCommand::Close => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// Split a seed's bitfield into a partial bitfield plus HAVEs for the withheld pieces
pub fn breakup_bitfield(have: &Bitfield) -> (Bitfield, Vec<u32>) {
    let mut ones: Vec<u32> = have.iter_ones().collect();
    ones.shuffle(&mut rand::thread_rng());
    let withheld: Vec<u32> = ones.into_iter().take(BREAKUP_WITHHELD.min(have.count_ones() as usize)).collect();
    let mut partial = have.clone();
    for piece in &withheld {
        partial.set(*piece, false);
    }
    (partial, withheld)
}

/// Messages announcing our pieces to a fresh connection
pub fn initial_announcement(have: &Bitfield, breakup: bool) -> Vec<Message> {
    if have.none() {
        return Vec::new();
    }
    if breakup && have.all() {
        let (partial, withheld) = breakup_bitfield(have);
        let mut messages = vec![Message::Bitfield {
            bitfield: partial.as_bytes().to_vec(),
        }];
        messages.extend(withheld.into_iter().map(|piece_index| Message::Have { piece_index }));
        return messages;
    }
    vec![Message::Bitfield {
        bitfield: have.as_bytes().to_vec(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ratelimit::{BucketPair, RateFudge};
    use tokio::net::TcpListener;

    fn limiter() -> PeerLimiter {
        let p = Duration::from_secs(1);
        PeerLimiter::new(BucketPair::unlimited(p), BucketPair::unlimited(p), BucketPair::unlimited(p), RateFudge::default(), false)
    }

    fn config(info_hash: [u8; 20]) -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            info_hash,
            our_peer_id: Handshake::generate_peer_id(),
            listen_port: 6881,
            request_backlog: 16,
            max_slice_length: 32 * 1024,
            keepalive_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            max_message_len: crate::protocol::message::MAX_MESSAGE_LEN,
        })
    }

    #[test]
    fn test_breakup_bitfield() {
        let have = Bitfield::full(20);
        let (partial, withheld) = breakup_bitfield(&have);
        assert_eq!(withheld.len(), 8);
        assert_eq!(partial.count_ones(), 12);
        for p in withheld {
            assert!(!partial.get(p));
        }
    }

    #[test]
    fn test_initial_announcement() {
        assert!(initial_announcement(&Bitfield::new(4), true).is_empty());
        let msgs = initial_announcement(&Bitfield::full(4), true);
        assert_eq!(msgs.len(), 5);
        assert!(matches!(msgs[0], Message::Bitfield { .. }));
        let msgs = initial_announcement(&Bitfield::full(4), false);
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [9u8; 20];

        let remote = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire::default();
            let theirs = wire.read_handshake(&mut sock).await.unwrap();
            assert!(theirs.supports_extension_protocol());
            wire.write_handshake(&mut sock, &Handshake::new(info_hash, [1u8; 20])).await.unwrap();
            wire.write_message(&mut sock, &Message::Unchoke).await.unwrap();
            let (msg, _) = wire.read_message(&mut sock).await.unwrap();
            assert_eq!(msg, Message::Interested);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::connect(addr, config(info_hash), limiter(), tx);
        match rx.recv().await.unwrap().1 {
            PeerEvent::Ready { peer_id, extensions } => {
                assert_eq!(peer_id, [1u8; 20]);
                assert!(!extensions);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap().1, PeerEvent::Received { .. }));
        assert!(matches!(rx.recv().await.unwrap().1, PeerEvent::Message(Message::Unchoke)));
        assert!(conn.send(Message::Interested));
        remote.await.unwrap();
        loop {
            if let PeerEvent::Closed { error } = rx.recv().await.unwrap().1 {
                assert!(error.is_none());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_late_bitfield_is_a_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [5u8; 20];
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire::default();
            let _ = wire.read_handshake(&mut sock).await;
            wire.write_handshake(&mut sock, &Handshake::new(info_hash, [2u8; 20])).await.unwrap();
            wire.write_message(&mut sock, &Message::Have { piece_index: 0 }).await.unwrap();
            wire.write_message(&mut sock, &Message::Bitfield { bitfield: vec![0x80] }).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::connect(addr, config(info_hash), limiter(), tx);
        let mut delivered = Vec::new();
        let error = loop {
            match rx.recv().await.unwrap().1 {
                PeerEvent::Message(m) => delivered.push(m),
                PeerEvent::Closed { error } => break error,
                _ => {}
            }
        };
        assert_eq!(delivered, vec![Message::Have { piece_index: 0 }]);
        assert_eq!(error.unwrap().kind(), ErrorKind::ProtocolViolation);
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_extension_handshake_message() {
        let message = extension_handshake(&config([1u8; 20])).unwrap();
        let Message::Extended { id, payload } = message else {
            panic!("not an extension message");
        };
        assert_eq!(id, HANDSHAKE_ID);
        let decoded = ExtensionHandshake::decode(&payload).unwrap();
        assert_eq!(decoded.reqq, Some(16));
    }

    #[tokio::test]
    async fn test_wrong_info_hash_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire::default();
            let _ = wire.read_handshake(&mut sock).await;
            let _ = wire.write_handshake(&mut sock, &Handshake::new([7u8; 20], [1u8; 20])).await;
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conn = PeerConnection::connect(addr, config([9u8; 20]), limiter(), tx);
        match rx.recv().await.unwrap().1 {
            PeerEvent::Closed { error: Some(e) } => assert_eq!(e.kind(), ErrorKind::ProtocolViolation),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_dict_pex_is_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [3u8; 20];
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire::default();
            let _ = wire.read_handshake(&mut sock).await;
            wire.write_handshake(&mut sock, &Handshake::with_extension_protocol(info_hash, [2u8; 20]))
                .await
                .unwrap();
            let payload = b"d1:md6:ut_pexi1eee".to_vec();
            wire.write_message(&mut sock, &Message::Extended { id: 0, payload }).await.unwrap();
            wire.write_message(&mut sock, &Message::Extended { id: LOCAL_UT_PEX_ID, payload: b"i42e".to_vec() })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conn = PeerConnection::connect(addr, config(info_hash), limiter(), tx);
        let mut saw_ext = false;
        loop {
            match rx.recv().await.unwrap().1 {
                PeerEvent::ExtensionHandshake(hs) => {
                    assert_eq!(hs.id_for("ut_pex"), Some(1));
                    saw_ext = true;
                }
                PeerEvent::Closed { error } => {
                    assert_eq!(error.unwrap().kind(), ErrorKind::ProtocolViolation);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_ext);
    }
}
