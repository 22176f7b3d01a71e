//! # blockgraph: Connectivity Graphs for Chunked Worlds
//!
//! Tracks wire-like networks in a sparse, chunk-loaded 3D world. Nodes are
//! discovered per block position, linked to their neighbours, and kept
//! partitioned into persistent graphs, one per connected component.
//!
//! ## Design Principles
//!
//! 1. **Content identity**: a node is `(position, value)` compared by value
//!    content, so successive discovery passes agree on "the same node"
//! 2. **Arena graphs**: nodes and links live in key-indexed maps, never in
//!    reference cycles
//! 3. **Sealed registries**: node, link-key and entity types are registered
//!    once per [`Universe`] and resolved by [`TypeTag`]
//! 4. **Lazy residency**: section data and graphs are loaded on demand and
//!    evicted when their columns go idle
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blockgraph::{BlockPos, GraphWorld, MemoryBlobStore, StorageConfig, Universe};
//!
//! # fn example() -> blockgraph::Result<()> {
//! let universe = Universe::builder("power").build()?;
//! let mut world = GraphWorld::open(
//!     universe,
//!     Arc::new(MemoryBlobStore::new()),
//!     StorageConfig::default(),
//! )?;
//!
//! world.update_nodes(BlockPos::new(0, 64, 0))?;
//! world.tick()?;
//! world.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | Positions, type tags, node and link identity |
//! | [`graph`] | Generic node/link graph with split and join |
//! | [`timer`] | Tick-driven eviction scheduling |
//! | [`storage`] | Blob stores, I/O worker, region store |
//! | [`registry`] | Universes and type registration |
//! | [`engine`] | The connectivity engine |
//! | [`wire`] | Connection rules for full, center and sided wires |
//! | [`world`] | All universes of a host world |
//! | [`ops`] | Operator commands |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod graph;
pub mod timer;
pub mod storage;
pub mod registry;
pub mod engine;
pub mod wire;
pub mod world;
pub mod ops;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{
    BlockNode, BlockPos, ColumnPos, Direction, GraphId, HalfLink, LinkKey, LinkKeyValue, LinkPos,
    NodePos, NodeValue, SectionPos, TypeTag,
};

// ============================================================================
// Re-exports: Storage and registry
// ============================================================================

pub use registry::{NodeDiscoverer, Universe, UniverseBuilder, UniverseRegistry};
pub use storage::{
    BlobConfig, BlobKey, BlobStore, FsBlobStore, MemoryBlobStore, SaveMode, StorageConfig,
};

// ============================================================================
// Re-exports: Engine
// ============================================================================

pub use engine::{
    BlockGraph, GraphEntity, GraphEntityType, GraphWorld, LinkEntity, LinkEntityType, NodeContext,
    NodeEntity, NodeEntityType, RebuildListener, WorldListener,
};
pub use wire::WireShape;
pub use world::GraphWorldStorage;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Duplicate registration: {0}")]
    DuplicateType(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(GraphId),

    #[error("Unknown universe: {0}")]
    UnknownUniverse(String),

    #[error("Storage worker stopped: {0}")]
    WorkerStopped(String),

    #[error("Graph world is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
