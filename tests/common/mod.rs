//! Shared fixtures: wire nodes, a mutable discoverer, a recording listener
//! and a counting graph entity.

#![allow(dead_code)]

use std::sync::Arc;

use blockgraph::engine::{GraphEntity, GraphEntityType, downcast_entity};
use blockgraph::model::LinkKeyValue;
use blockgraph::storage::SaveMode;
use blockgraph::{
    BlockGraph, BlockNode, BlockPos, GraphId, GraphWorld, HalfLink, MemoryBlobStore, NodeContext,
    NodeDiscoverer, NodePos, NodeValue, Result, StorageConfig, TypeTag, Universe, WorldListener,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const WIRE: TypeTag = TypeTag::from_static("test:wire");
pub const SENSOR: TypeTag = TypeTag::from_static("test:sensor");
pub const CENSUS: TypeTag = TypeTag::from_static("test:census");

// ============================================================================
// Nodes
// ============================================================================

/// Connects to face-adjacent wires of the same colour.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wire {
    pub color: u8,
}

impl BlockNode for Wire {
    fn type_tag(&self) -> TypeTag {
        WIRE
    }

    fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    fn find_connections(&self, ctx: &mut NodeContext<'_>) -> Vec<HalfLink> {
        let mut found = Vec::new();
        for pos in ctx.pos().adjacent() {
            for node in ctx.nodes_at(pos) {
                if node.node.downcast_ref::<Wire>() == Some(self) {
                    found.push(HalfLink::new(LinkKeyValue::empty(), node));
                }
            }
        }
        found
    }

    fn can_connect(&self, ctx: &mut NodeContext<'_>, link: &HalfLink) -> bool {
        link.other.node.downcast_ref::<Wire>() == Some(self)
            && ctx.pos().adjacent().contains(&link.other.pos)
    }
}

/// Offers itself to any adjacent node and accepts anything. Wires refuse
/// it, so every check it takes part in is one-sided.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sensor;

impl BlockNode for Sensor {
    fn type_tag(&self) -> TypeTag {
        SENSOR
    }

    fn find_connections(&self, ctx: &mut NodeContext<'_>) -> Vec<HalfLink> {
        let mut found = Vec::new();
        for pos in ctx.pos().adjacent() {
            for node in ctx.nodes_at(pos) {
                found.push(HalfLink::new(LinkKeyValue::empty(), node));
            }
        }
        found
    }

    fn can_connect(&self, _ctx: &mut NodeContext<'_>, _link: &HalfLink) -> bool {
        true
    }
}

pub fn wire_value(color: u8) -> NodeValue {
    NodeValue::new(Wire { color })
}

pub fn wire(x: i32, y: i32, z: i32) -> NodePos {
    NodePos::new(BlockPos::new(x, y, z), wire_value(0))
}

// ============================================================================
// Discoverer
// ============================================================================

/// Answers from a map the test edits.
#[derive(Default)]
pub struct MapDiscoverer {
    nodes: Mutex<HashMap<BlockPos, Vec<NodeValue>>>,
}

impl MapDiscoverer {
    pub fn place(&self, pos: BlockPos, value: NodeValue) {
        self.nodes.lock().entry(pos).or_default().push(value);
    }

    pub fn clear(&self, pos: BlockPos) {
        self.nodes.lock().remove(&pos);
    }
}

impl NodeDiscoverer for MapDiscoverer {
    fn discover(&self, pos: BlockPos) -> Vec<NodeValue> {
        self.nodes.lock().get(&pos).cloned().unwrap_or_default()
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(GraphId),
    Destroyed(GraphId),
    Updated(GraphId),
    Unloading(GraphId),
    Changed(NodePos),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn changed(&self) -> Vec<NodePos> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Changed(node) => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl WorldListener for RecordingListener {
    fn on_graph_created(&self, _universe: &str, graph: GraphId) {
        self.push(Event::Created(graph));
    }

    fn on_graph_destroyed(&self, _universe: &str, graph: GraphId) {
        self.push(Event::Destroyed(graph));
    }

    fn on_graph_updated(&self, _universe: &str, graph: GraphId) {
        self.push(Event::Updated(graph));
    }

    fn on_graph_unloading(&self, _universe: &str, graph: GraphId) {
        self.push(Event::Unloading(graph));
    }

    fn on_connections_changed(&self, _universe: &str, node: &NodePos) {
        self.push(Event::Changed(node.clone()));
    }
}

// ============================================================================
// Graph entity
// ============================================================================

/// Counts merges and ticks of its graph.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Census {
    pub merges: u32,
    pub ticks: u64,
    pub created: u64,
}

impl GraphEntity for Census {
    fn type_tag(&self) -> TypeTag {
        CENSUS
    }

    fn encode(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn merge(&mut self, other: Box<dyn GraphEntity>) {
        if let Some(other) = downcast_entity::<Census>(other) {
            self.merges += other.merges + 1;
            self.created += other.created;
        }
    }

    fn split_new(&self, _original: &BlockGraph, split: &BlockGraph) -> Box<dyn GraphEntity> {
        Box::new(Census { merges: 0, ticks: self.ticks, created: split.len() as u64 })
    }

    fn on_tick(&mut self, _graph: &BlockGraph) {
        self.ticks += 1;
    }

    fn on_node_created(&mut self, _node: &NodePos) {
        self.created += 1;
    }
}

// ============================================================================
// Worlds
// ============================================================================

pub struct Fixture {
    pub world: GraphWorld,
    pub store: MemoryBlobStore,
    pub discoverer: Arc<MapDiscoverer>,
    pub listener: Arc<RecordingListener>,
}

pub fn universe(
    id: &str,
    discoverer: Arc<MapDiscoverer>,
    listener: Arc<RecordingListener>,
    save_mode: SaveMode,
) -> Arc<Universe> {
    Universe::builder(id)
        .node_type_serde::<Wire>(WIRE)
        .node_type_serde::<Sensor>(SENSOR)
        .graph_entity_type(GraphEntityType::serde::<Census>(CENSUS))
        .discoverer(discoverer)
        .listener(listener)
        .save_mode(save_mode)
        .build()
        .unwrap()
}

pub fn fixture_with(store: MemoryBlobStore, config: StorageConfig, save_mode: SaveMode) -> Fixture {
    init_tracing();
    let discoverer = Arc::new(MapDiscoverer::default());
    let listener = Arc::new(RecordingListener::default());
    let universe = universe("test", discoverer.clone(), listener.clone(), save_mode);
    let world = GraphWorld::open(universe, Arc::new(store.clone()), config).unwrap();
    Fixture { world, store, discoverer, listener }
}

pub fn fixture() -> Fixture {
    fixture_with(MemoryBlobStore::new(), StorageConfig::default(), SaveMode::Manual)
}

impl Fixture {
    /// Place a node in the discoverer and run discovery at its position.
    pub fn place(&mut self, node: &NodePos) {
        self.discoverer.place(node.pos, node.node.clone());
        self.world.update_nodes(node.pos).unwrap();
    }

    /// Remove everything at `pos` from the discoverer and rediscover.
    pub fn clear(&mut self, pos: BlockPos) {
        self.discoverer.clear(pos);
        self.world.update_nodes(pos).unwrap();
    }

    pub fn graph_of(&mut self, node: &NodePos) -> GraphId {
        self.world.graph_id_at(node).unwrap()
    }

    pub fn graph_len(&mut self, id: GraphId) -> usize {
        self.world.graph(id).map_or(0, BlockGraph::len)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll `check` until it holds or a second has passed. Writes land on the
/// storage worker asynchronously.
pub fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    check()
}
