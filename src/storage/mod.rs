//! # Durable Blob Storage
//!
//! The contract between the connectivity engine and whatever keeps its bytes.
//! Blobs are opaque; a `None` write deletes.
//!
//! ## Implementations
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryBlobStore` | `memory` | In-memory for testing/embedding |
//! | `FsBlobStore` | `fs` | One file per key under a root directory |
//!
//! On top of a store sit the [`StorageWorker`] (async I/O with a blocking
//! façade for the owning thread) and the [`RegionStore`] (per-column
//! residency, eviction and save policy).

pub mod fs;
pub mod memory;
pub mod region;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::model::{ColumnPos, GraphId};
use crate::timer::DEFAULT_MAX_AGE;
use crate::{Error, Result};

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use region::{Pillar, RegionSection, RegionStore, RegionTick, SectionMut};
pub use worker::StorageWorker;

// ============================================================================
// Keys
// ============================================================================

/// Address of one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlobKey {
    /// Section index data for one column.
    Region(ColumnPos),
    /// One connectivity graph.
    Graph(GraphId),
    /// Per-world engine state (id allocator).
    State,
}

impl BlobKey {
    pub fn kind(&self) -> BlobKind {
        match self {
            BlobKey::Region(_) => BlobKind::Region,
            BlobKey::Graph(_) => BlobKind::Graph,
            BlobKey::State => BlobKind::State,
        }
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobKey::Region(pos) => write!(f, "region{pos}"),
            BlobKey::Graph(id) => write!(f, "graph:{}", id.to_hex()),
            BlobKey::State => write!(f, "state"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Region,
    Graph,
    State,
}

// ============================================================================
// Blob store trait
// ============================================================================

/// Durable key → blob storage. Implementations must be usable from any
/// thread; the engine only calls them from its I/O worker.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Read a blob. `Ok(None)` when nothing is stored under `key`.
    async fn read(&self, key: &BlobKey) -> Result<Option<Bytes>>;

    /// Store a blob, or delete it when `blob` is `None`.
    async fn write(&self, key: &BlobKey, blob: Option<Bytes>) -> Result<()>;

    /// Every stored key of one kind.
    async fn list(&self, kind: BlobKind) -> Result<Vec<BlobKey>>;

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        self.write(key, None).await
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.read(key).await?.is_some())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Where a world's blobs live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobConfig {
    /// In-memory (no persistence)
    #[default]
    Memory,

    /// One directory per universe under `root`.
    Filesystem {
        root: PathBuf,
        #[serde(default)]
        sync_writes: bool,
    },
}

impl BlobConfig {
    /// Open the store for one universe.
    pub fn open(&self, universe: &str) -> Result<Arc<dyn BlobStore>> {
        match self {
            BlobConfig::Memory => Ok(Arc::new(MemoryBlobStore::new())),
            BlobConfig::Filesystem { root, sync_writes } => {
                let dir = root.join(sanitize_dir_name(universe));
                Ok(Arc::new(FsBlobStore::new(dir, *sync_writes)))
            }
        }
    }
}

fn sanitize_dir_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

/// When dirty data is written back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Only on explicit save-all or shutdown.
    Manual,
    /// A tenth of the dirty set per tick, rounded up.
    #[default]
    Incremental,
    /// Everything dirty, every tick.
    Immediate,
}

/// Storage and residency settings shared by every universe of a world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub blob: BlobConfig,
    /// Idle ticks before an unpinned column is evicted.
    pub max_age_ticks: u64,
    /// Incremental saves flush `ceil(dirty / factor)` entries per tick.
    pub incremental_save_factor: usize,
    /// Lowest section y, inclusive.
    pub min_section_y: i32,
    /// Highest section y, exclusive.
    pub max_section_y: i32,
    pub max_graphs_rebuilt_per_tick: usize,
    /// Ticks between rebuild progress reports.
    pub rebuild_progress_interval: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob: BlobConfig::Memory,
            max_age_ticks: DEFAULT_MAX_AGE,
            incremental_save_factor: 10,
            min_section_y: -4,
            max_section_y: 20,
            max_graphs_rebuilt_per_tick: 100,
            rebuild_progress_interval: 20,
        }
    }
}

impl StorageConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.incremental_save_factor == 0 {
            return Err(Error::InvalidConfig("incremental_save_factor must be positive".into()));
        }
        if self.min_section_y >= self.max_section_y {
            return Err(Error::InvalidConfig(format!(
                "empty section range {}..{}",
                self.min_section_y, self.max_section_y
            )));
        }
        if self.max_graphs_rebuilt_per_tick == 0 {
            return Err(Error::InvalidConfig("max_graphs_rebuilt_per_tick must be positive".into()));
        }
        Ok(())
    }

    pub fn section_range(&self) -> std::ops::Range<i32> {
        self.min_section_y..self.max_section_y
    }
}
