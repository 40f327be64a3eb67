//! Durable state of non-clean sessions
//!
//! Each session is stored across one collection per concern: flags,
//! subscriptions, in-flight deliveries, queued deliveries and QoS 2
//! second-phase ids. Message contents referenced by those deliveries live
//! in their own collection.
//!
//! Storage sits behind [`StorageBackend`]: [`FjallBackend`] writes an LSM
//! keyspace on disk, [`MemoryBackend`] keeps everything in process.

mod backend;
mod error;
mod fjall;
mod memory;
mod models;

pub use backend::{Collection, PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{
    decode_value, encode_value, LoadedData, StoredInflight, StoredMessage, StoredSecondPhase,
    StoredSession, StoredSessionFlags, StoredSubscription,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the write-behind channel
const QUEUE_DEPTH: usize = 10_000;

/// Write-behind front end of a [`StorageBackend`].
///
/// Callers enqueue [`PersistenceOp`]s without waiting; a background task
/// commits them in batches, either once `max_batch_size` operations have
/// accumulated or every `flush_interval`.
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    stop: mpsc::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Must be called inside a tokio runtime; spawns the writer task
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (stop, stopped) = mpsc::channel(1);

        let writer = BatchWriter {
            backend: Arc::clone(&backend),
            pending: Vec::with_capacity(max_batch_size),
            max_batch_size: max_batch_size.max(1),
        };
        let handle = tokio::spawn(writer.run(rx, stopped, flush_interval));

        Self {
            backend,
            tx,
            stop,
            writer: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue without blocking. A full or closed queue drops the operation.
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("Dropping persistence operation: {}", e);
        }
    }

    /// Enqueue several operations; their order is kept
    pub fn write_all(&self, ops: impl IntoIterator<Item = PersistenceOp>) {
        ops.into_iter().for_each(|op| self.write(op));
    }

    /// The wrapped backend, for reads and unbatched writes
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Commit everything enqueued so far, then flush and close the backend
    pub async fn shutdown(&self) -> Result<()> {
        info!("Stopping persistence writer");
        let _ = self.stop.send(()).await;

        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Persistence writer panicked: {}", e);
            }
        }

        self.backend.flush().await?;
        self.backend.close().await?;
        info!("Persistence closed");
        Ok(())
    }
}

/// State of the background commit task
struct BatchWriter {
    backend: Arc<dyn StorageBackend>,
    pending: Vec<PersistenceOp>,
    max_batch_size: usize,
}

impl BatchWriter {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut stopped: mpsc::Receiver<()>,
        flush_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => match op {
                    Some(op) => {
                        self.pending.push(op);
                        if self.pending.len() >= self.max_batch_size {
                            self.commit("batch full").await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.commit("interval").await,
                _ = stopped.recv() => {
                    // Take what was enqueued before the stop request
                    rx.close();
                    while let Some(op) = rx.recv().await {
                        self.pending.push(op);
                    }
                    break;
                }
            }
        }

        self.commit("shutdown").await;
        debug!("Persistence writer exited");
    }

    async fn commit(&mut self, trigger: &'static str) {
        if self.pending.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.pending);
        let count = ops.len();
        match self.backend.batch_write(ops).await {
            Ok(()) => debug!(count, trigger, "Committed persistence batch"),
            Err(e) => error!(count, trigger, "Persistence batch failed: {}", e),
        }
    }
}
