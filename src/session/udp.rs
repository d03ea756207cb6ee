//! Shared UDP socket
//!
//! One socket per session serves UDP trackers and the DHT. Tracker replies are
//! matched to waiters by transaction id; bencoded datagrams go to the DHT.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;

/// Datagram routed to the DHT: `(from, bytes)`
pub type Datagram = (SocketAddr, Vec<u8>);

#[derive(Debug)]
pub struct UdpMux {
    socket: UdpSocket,
    pending: Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>,
    dht: Mutex<Option<mpsc::UnboundedSender<Datagram>>>,
}

impl UdpMux {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to bind UDP socket", addr.to_string(), e.to_string()))?;
        debug!("UDP socket bound on {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            socket,
            pending: Mutex::new(HashMap::new()),
            dht: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start the receive loop; abort the handle to stop it
    pub fn spawn_reader(self: &Arc<Self>) -> JoinHandle<()> {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match mux.socket.recv_from(&mut buf).await {
                    Ok((n, from)) => mux.route(from, &buf[..n]),
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms
                        trace!("UDP receive error: {}", e);
                    }
                }
            }
        })
    }

    fn route(&self, from: SocketAddr, data: &[u8]) {
        if data.first() == Some(&b'd') {
            if let Ok(guard) = self.dht.lock() {
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.send((from, data.to_vec()));
                    return;
                }
            }
            trace!("Dropping DHT datagram from {}: DHT disabled", from);
            return;
        }
        if data.len() < 8 {
            return;
        }
        let tid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&tid));
        match waiter {
            Some(tx) => {
                let _ = tx.send(data.to_vec());
            }
            None => trace!("Unmatched UDP reply from {} (transaction {:x})", from, tid),
        }
    }

    /// Receive DHT datagrams; replaces any earlier receiver
    pub fn attach_dht(&self) -> mpsc::UnboundedReceiver<Datagram> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut guard) = self.dht.lock() {
            *guard = Some(tx);
        }
        rx
    }

    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, to)
            .await
            .map_err(|e| TorrentError::network_error_full("UDP send failed", to.to_string(), e.to_string()))?;
        Ok(())
    }

    /// Send a request and wait for the reply carrying `tid`; None on timeout
    pub async fn transact(&self, to: SocketAddr, tid: u32, packet: &[u8], wait: Duration) -> Result<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(tid, tx);
        }
        if let Err(e) = self.send_to(packet, to).await {
            self.cancel(tid);
            return Err(e);
        }
        match timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => {
                warn!("UDP waiter for transaction {:x} dropped", tid);
                Ok(None)
            }
            Err(_) => {
                self.cancel(tid);
                Ok(None)
            }
        }
    }

    fn cancel(&self, tid: u32) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&tid);
        }
    }
}
