//! Connectivity engine.
//!
//! [`GraphWorld`] keeps each universe's network partitioned into
//! [`BlockGraph`]s, one per connected component, and maintains the
//! per-section [`GraphChunk`] index that maps positions to graphs.

mod block_graph;
mod chunk;
mod context;
mod entity;
mod events;
mod rebuild;
mod world;

pub use block_graph::{BlockGraph, NodeGraph};
pub use chunk::GraphChunk;
pub use context::NodeContext;
pub use entity::{
    AsAny, EntityDecoder, EntityFactory, EntityType, GraphEntity, GraphEntityType, LinkEntity,
    LinkEntityType, NodeEntity, NodeEntityType, downcast_entity,
};
pub use events::{LoggingRebuild, RebuildListener, SilentRebuild, WorldListener};
pub use world::GraphWorld;
