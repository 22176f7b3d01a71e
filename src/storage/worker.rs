//! Background I/O worker with a synchronous façade.
//!
//! The engine runs on a single owning thread and needs some answers right
//! away (a connectivity query has no "not loaded yet" state), so reads can
//! be joined with [`StorageWorker::read_blocking`]. Everything else runs on
//! the worker's own runtime:
//!
//! - writes are queued, applied in order, and coalesced per key;
//! - reads see queued writes first (read-your-writes);
//! - prefetches complete into a channel the owner drains on its own thread.
//!
//! The blocking methods must not be called from inside an async runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

use super::{BlobKey, BlobKind, BlobStore};
use crate::{Error, Result};

/// Result of a prefetch, delivered to the owner's channel together with
/// the caller's token.
pub type Prefetched = (BlobKey, u64, Result<Option<Bytes>>);

struct PendingWrite {
    blob: Option<Bytes>,
    seq: u64,
}

type PendingMap = Arc<Mutex<HashMap<BlobKey, PendingWrite>>>;

enum Command {
    Write(BlobKey, u64),
    Flush(oneshot::Sender<()>),
}

pub struct StorageWorker {
    name: String,
    runtime: Runtime,
    store: Arc<dyn BlobStore>,
    pending: PendingMap,
    queue: mpsc::UnboundedSender<Command>,
    next_seq: AtomicU64,
}

impl StorageWorker {
    /// Start a worker thread named `<name>-io` over `store`.
    pub fn spawn(name: impl Into<String>, store: Arc<dyn BlobStore>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{name}-io"))
            .enable_all()
            .build()?;

        let pending: PendingMap = Arc::default();
        let (queue, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_writes(name.clone(), store.clone(), pending.clone(), rx));

        tracing::debug!(worker = %name, "storage worker started");
        Ok(Self {
            name,
            runtime,
            store,
            pending,
            queue,
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of writes queued but not yet applied.
    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a write. `None` deletes. Later writes to the same key replace
    /// earlier ones that have not started yet.
    pub fn write(&self, key: BlobKey, blob: Option<Bytes>) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(key, PendingWrite { blob, seq });
        self.queue
            .send(Command::Write(key, seq))
            .map_err(|_| Error::WorkerStopped(self.name.clone()))
    }

    /// Read on the worker and block the calling thread until it completes.
    pub fn read_blocking(&self, key: BlobKey) -> Result<Option<Bytes>> {
        if let Some(blob) = self.queued(&key) {
            return Ok(blob);
        }
        let (tx, rx) = oneshot::channel();
        let store = self.store.clone();
        self.runtime.spawn(async move {
            let _ = tx.send(store.read(&key).await);
        });
        rx.blocking_recv()
            .map_err(|_| Error::WorkerStopped(self.name.clone()))?
    }

    /// Start a read without waiting. The result is sent to `done`.
    pub fn prefetch(&self, key: BlobKey, token: u64, done: std::sync::mpsc::Sender<Prefetched>) {
        if let Some(blob) = self.queued(&key) {
            let _ = done.send((key, token, Ok(blob)));
            return;
        }
        let store = self.store.clone();
        self.runtime.spawn(async move {
            let result = store.read(&key).await;
            let _ = done.send((key, token, result));
        });
    }

    /// Stored keys of one kind. Queued writes are flushed first so the
    /// listing reflects them.
    pub fn list_blocking(&self, kind: BlobKind) -> Result<Vec<BlobKey>> {
        self.flush_blocking()?;
        let (tx, rx) = oneshot::channel();
        let store = self.store.clone();
        self.runtime.spawn(async move {
            let _ = tx.send(store.list(kind).await);
        });
        rx.blocking_recv()
            .map_err(|_| Error::WorkerStopped(self.name.clone()))?
    }

    /// Block until every write queued so far has been applied.
    pub fn flush_blocking(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Command::Flush(tx))
            .map_err(|_| Error::WorkerStopped(self.name.clone()))?;
        rx.blocking_recv()
            .map_err(|_| Error::WorkerStopped(self.name.clone()))
    }

    fn queued(&self, key: &BlobKey) -> Option<Option<Bytes>> {
        self.pending.lock().get(key).map(|w| w.blob.clone())
    }
}

impl std::fmt::Debug for StorageWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWorker")
            .field("name", &self.name)
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}

impl Drop for StorageWorker {
    fn drop(&mut self) {
        let pending = self.pending_writes();
        if pending > 0 {
            tracing::warn!(worker = %self.name, pending, "storage worker dropped with unflushed writes");
        }
    }
}

async fn run_writes(
    name: String,
    store: Arc<dyn BlobStore>,
    pending: PendingMap,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(key, seq) => {
                let blob = {
                    let pending = pending.lock();
                    match pending.get(&key) {
                        Some(write) if write.seq == seq => write.blob.clone(),
                        // Superseded: a later command carries the newer blob.
                        _ => continue,
                    }
                };

                if let Err(e) = store.write(&key, blob).await {
                    tracing::error!(worker = %name, key = %key, error = %e, "blob write failed");
                }

                let mut pending = pending.lock();
                if pending.get(&key).is_some_and(|w| w.seq == seq) {
                    pending.remove(&key);
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnPos, GraphId};
    use crate::storage::MemoryBlobStore;

    fn worker() -> (StorageWorker, MemoryBlobStore) {
        let store = MemoryBlobStore::new();
        let worker = StorageWorker::spawn("test", Arc::new(store.clone())).unwrap();
        (worker, store)
    }

    #[test]
    fn test_read_your_writes_before_flush() {
        let (worker, store) = worker();
        let key = BlobKey::Graph(GraphId(1));

        worker.write(key, Some(Bytes::from_static(b"one"))).unwrap();
        assert_eq!(worker.read_blocking(key).unwrap(), Some(Bytes::from_static(b"one")));

        worker.flush_blocking().unwrap();
        assert_eq!(worker.pending_writes(), 0);
        assert_eq!(store.get(&key), Some(Bytes::from_static(b"one")));
    }

    #[test]
    fn test_last_write_wins() {
        let (worker, store) = worker();
        let key = BlobKey::State;
        for i in 0..50u8 {
            worker.write(key, Some(Bytes::from(vec![i]))).unwrap();
        }
        worker.write(key, None).unwrap();
        worker.write(key, Some(Bytes::from_static(b"final"))).unwrap();
        worker.flush_blocking().unwrap();
        assert_eq!(store.get(&key), Some(Bytes::from_static(b"final")));
        assert!(store.stats().writes < 52);
    }

    #[test]
    fn test_prefetch_delivers_to_channel() {
        let (worker, store) = worker();
        let key = BlobKey::Region(ColumnPos::new(0, 0));
        store.insert(key, Bytes::from_static(b"x"));

        let (tx, rx) = std::sync::mpsc::channel();
        worker.prefetch(key, 9, tx);
        let (got, token, result) = rx.recv().unwrap();
        assert_eq!(got, key);
        assert_eq!(token, 9);
        assert_eq!(result.unwrap(), Some(Bytes::from_static(b"x")));
    }

    #[test]
    fn test_list_reflects_queued_writes() {
        let (worker, store) = worker();
        store.insert(BlobKey::Graph(GraphId(1)), Bytes::new());
        store.insert(BlobKey::Graph(GraphId(2)), Bytes::new());

        worker.write(BlobKey::Graph(GraphId(2)), None).unwrap();
        worker.write(BlobKey::Graph(GraphId(3)), Some(Bytes::new())).unwrap();
        let keys = worker.list_blocking(BlobKind::Graph).unwrap();
        assert_eq!(keys, vec![BlobKey::Graph(GraphId(1)), BlobKey::Graph(GraphId(3))]);
    }
}
