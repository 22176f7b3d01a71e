//! In-memory blob store.
//!
//! Blobs live in a `HashMap` behind a `RwLock`. Clones share the same
//! contents, so a test can keep a handle while a world owns another and
//! reopen a world over the same data afterwards.
//!
//! Operation counters make write behaviour observable (deletes versus
//! empty writes, flush volume per tick).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{BlobKey, BlobKind, BlobStore};
use crate::Result;

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    blobs: RwLock<HashMap<BlobKey, Bytes>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

/// Snapshot of operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            reads: self.inner.reads.load(Ordering::Relaxed),
            writes: self.inner.writes.load(Ordering::Relaxed),
            deletes: self.inner.deletes.load(Ordering::Relaxed),
        }
    }

    /// Synchronous peek, bypassing counters.
    pub fn get(&self, key: &BlobKey) -> Option<Bytes> {
        self.inner.blobs.read().get(key).cloned()
    }

    /// Synchronous insert, bypassing counters.
    pub fn insert(&self, key: BlobKey, blob: Bytes) {
        self.inner.blobs.write().insert(key, blob);
    }

    pub fn len(&self) -> usize {
        self.inner.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.blobs.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlobStore")
            .field("blobs", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, key: &BlobKey) -> Result<Option<Bytes>> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.blobs.read().get(key).cloned())
    }

    async fn write(&self, key: &BlobKey, blob: Option<Bytes>) -> Result<()> {
        let mut blobs = self.inner.blobs.write();
        match blob {
            Some(blob) => {
                self.inner.writes.fetch_add(1, Ordering::Relaxed);
                blobs.insert(*key, blob);
            }
            None => {
                self.inner.deletes.fetch_add(1, Ordering::Relaxed);
                blobs.remove(key);
            }
        }
        Ok(())
    }

    async fn list(&self, kind: BlobKind) -> Result<Vec<BlobKey>> {
        let mut keys: Vec<BlobKey> = self
            .inner
            .blobs
            .read()
            .keys()
            .filter(|key| key.kind() == kind)
            .copied()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnPos, GraphId};

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = MemoryBlobStore::new();
        let key = BlobKey::Region(ColumnPos::new(1, -2));

        assert_eq!(store.read(&key).await.unwrap(), None);
        store.write(&key, Some(Bytes::from_static(b"abc"))).await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), Some(Bytes::from_static(b"abc")));
        assert!(store.exists(&key).await.unwrap());

        store.delete(&key).await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), None);
        assert_eq!(store.stats(), MemoryStats { reads: 4, writes: 1, deletes: 1 });
    }

    #[tokio::test]
    async fn test_list_filters_by_kind_and_shares_clones() {
        let store = MemoryBlobStore::new();
        let handle = store.clone();
        store.write(&BlobKey::Graph(GraphId(2)), Some(Bytes::new())).await.unwrap();
        store.write(&BlobKey::Graph(GraphId(1)), Some(Bytes::new())).await.unwrap();
        store.write(&BlobKey::State, Some(Bytes::new())).await.unwrap();

        let graphs = handle.list(BlobKind::Graph).await.unwrap();
        assert_eq!(graphs, vec![BlobKey::Graph(GraphId(1)), BlobKey::Graph(GraphId(2))]);
        assert_eq!(handle.len(), 3);
    }
}
