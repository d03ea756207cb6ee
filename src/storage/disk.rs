//! Disk worker pool and per-download writer
//!
//! Blocking file work runs on tokio's blocking threads, gated by a semaphore so
//! at most `workers` jobs run at once. Each download owns one writer task that
//! applies its writes in FIFO order and verifies completed pieces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::TorrentError;
use crate::storage::file::FileStorage;

/// Bounded pool for blocking disk and hashing work
#[derive(Debug, Clone)]
pub struct DiskPool {
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    max_queue: usize,
}

impl DiskPool {
    pub fn new(workers: usize, max_queue: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            queued: Arc::new(AtomicUsize::new(0)),
            max_queue,
        }
    }

    /// Run a blocking closure on the pool
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let queued = self.queued.clone();
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                queued.fetch_sub(1, Ordering::SeqCst);
                return Err(TorrentError::io_error("Disk pool is closed").into());
            }
        };
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await;
        queued.fetch_sub(1, Ordering::SeqCst);
        result.map_err(|e| TorrentError::io_error(format!("Disk job panicked: {}", e)))?
    }

    /// Jobs waiting or running
    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// True when new requests should be held back until the queue drains
    pub fn is_congested(&self) -> bool {
        self.queue_len() > self.max_queue
    }

    /// Stop admitting jobs; queued ones fail
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Work for the per-download writer
#[derive(Debug)]
pub enum DiskJob {
    Write { piece: u32, offset: u32, data: Vec<u8> },
    /// Hash a completed piece `checks` times; every pass must match
    Verify { piece: u32, checks: u8 },
    /// Extend a file toward `target` bytes (background allocation)
    Extend { file: usize, target: u64 },
    /// Sync to disk and reply once every earlier job is done
    Flush { reply: oneshot::Sender<Result<()>> },
}

/// Completion notices posted back to the download controller
#[derive(Debug)]
pub enum DiskEvent {
    PieceChecked { piece: u32, ok: bool },
    WriteFailed { piece: u32, error: TorrentError },
    Extended { file: usize, len: u64 },
}

/// Handle to a download's writer task
#[derive(Debug, Clone)]
pub struct DiskWriter {
    tx: mpsc::UnboundedSender<DiskJob>,
    pending: Arc<AtomicUsize>,
}

impl DiskWriter {
    /// Start the writer task for `storage`
    pub fn spawn(
        storage: Arc<FileStorage>,
        pool: DiskPool,
        events: mpsc::UnboundedSender<DiskEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<DiskJob>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                Self::handle_job(&storage, &pool, &events, job).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("Disk writer for {} stopped", storage.torrent_info().info_hash_hex());
        });

        (Self { tx, pending }, handle)
    }

    async fn handle_job(
        storage: &Arc<FileStorage>,
        pool: &DiskPool,
        events: &mpsc::UnboundedSender<DiskEvent>,
        job: DiskJob,
    ) {
        match job {
            DiskJob::Write { piece, offset, data } => {
                let st = storage.clone();
                if let Err(e) = pool.run(move || st.write(piece, offset, &data)).await {
                    error!("Write to piece {} failed: {}", piece, e);
                    let error = match e.downcast::<TorrentError>() {
                        Ok(te) => te,
                        Err(other) => TorrentError::io_error(other.to_string()),
                    };
                    let _ = events.send(DiskEvent::WriteFailed { piece, error });
                }
            }
            DiskJob::Verify { piece, checks } => {
                let st = storage.clone();
                let ok = pool
                    .run(move || Ok((0..checks.max(1)).all(|_| st.verify_piece(piece))))
                    .await
                    .unwrap_or(false);
                trace!("Piece {} verified: {}", piece, ok);
                let _ = events.send(DiskEvent::PieceChecked { piece, ok });
            }
            DiskJob::Extend { file, target } => {
                let st = storage.clone();
                match pool.run(move || st.extend_file(file, target)).await {
                    Ok(len) => {
                        let _ = events.send(DiskEvent::Extended { file, len });
                    }
                    Err(e) => warn!("Background allocation of file {} failed: {}", file, e),
                }
            }
            DiskJob::Flush { reply } => {
                let st = storage.clone();
                let _ = reply.send(pool.run(move || st.sync()).await);
            }
        }
    }

    /// Queue a job; fails only when the writer has stopped
    pub fn submit(&self, job: DiskJob) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            TorrentError::io_error("Disk writer has stopped").into()
        })
    }

    /// Wait until all earlier jobs are applied and synced
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(DiskJob::Flush { reply })?;
        rx.await
            .map_err(|_| TorrentError::io_error("Disk writer dropped flush request"))?
    }

    /// Jobs not yet applied
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::{AllocPolicy, LockingPolicy};
    use crate::torrent::TorrentBuilder;

    #[tokio::test]
    async fn test_pool_runs_and_counts() {
        let pool = DiskPool::new(2, 4);
        let v = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(v, 42);
        assert_eq!(pool.queue_len(), 0);
        assert!(!pool.is_congested());
    }

    #[tokio::test]
    async fn test_pool_propagates_errors() {
        let pool = DiskPool::new(1, 4);
        let result: Result<()> = pool.run(|| Err(TorrentError::io_error("boom").into())).await;
        assert!(result.is_err());
        pool.close();
        assert!(pool.run(|| Ok(())).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_fifo_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        let info = Arc::new(TorrentBuilder::from_memory("w.bin", data.clone(), 20).build().unwrap());
        let storage = Arc::new(
            FileStorage::open(dir.path().to_path_buf(), info, vec![true], AllocPolicy::Normal, LockingPolicy::WhileWriting)
                .unwrap(),
        );
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (writer, _task) = DiskWriter::spawn(storage, DiskPool::new(2, 16), events_tx);

        writer.submit(DiskJob::Write { piece: 0, offset: 0, data: data[..10].to_vec() }).unwrap();
        writer.submit(DiskJob::Write { piece: 0, offset: 10, data: data[10..20].to_vec() }).unwrap();
        writer.submit(DiskJob::Verify { piece: 0, checks: 2 }).unwrap();
        writer.submit(DiskJob::Write { piece: 1, offset: 0, data: vec![0; 20] }).unwrap();
        writer.submit(DiskJob::Verify { piece: 1, checks: 1 }).unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.pending(), 0);

        match events_rx.recv().await.unwrap() {
            DiskEvent::PieceChecked { piece, ok } => assert_eq!((piece, ok), (0, true)),
            other => panic!("unexpected {:?}", other),
        }
        match events_rx.recv().await.unwrap() {
            DiskEvent::PieceChecked { piece, ok } => assert_eq!((piece, ok), (1, false)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
