//! Per-section node index: which nodes sit where and which graph owns them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::Result;
use crate::model::{BlockPos, GraphId, NodePos, NodeValue, SectionPos, TypeTag};
use crate::registry::Universe;
use crate::storage::RegionSection;

type Entries = SmallVec<[(NodeValue, GraphId); 2]>;

#[derive(Debug, Clone)]
pub struct GraphChunk {
    pos: SectionPos,
    nodes: BTreeMap<u16, Entries>,
    graphs: BTreeMap<GraphId, u32>,
}

#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    nodes: Vec<Value>,
}

#[derive(Serialize, Deserialize)]
struct ChunkNodeRecord {
    pos: u16,
    graph: GraphId,
    #[serde(rename = "type")]
    type_tag: TypeTag,
    #[serde(default)]
    data: Value,
}

impl GraphChunk {
    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    pub fn node_count(&self) -> usize {
        self.nodes.values().map(SmallVec::len).sum()
    }

    /// Graphs with at least one node in this section.
    pub fn graph_ids(&self) -> impl Iterator<Item = GraphId> + '_ {
        self.graphs.keys().copied()
    }

    pub fn contains_graph(&self, graph: GraphId) -> bool {
        self.graphs.contains_key(&graph)
    }

    pub fn nodes_at(&self, pos: BlockPos) -> impl Iterator<Item = (NodePos, GraphId)> + '_ {
        self.nodes
            .get(&pos.local_index())
            .into_iter()
            .flatten()
            .map(move |(value, graph)| (NodePos::new(pos, value.clone()), *graph))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodePos, GraphId)> + '_ {
        self.nodes.iter().flat_map(move |(local, entries)| {
            let pos = self.pos.block_at(*local);
            entries.iter().map(move |(value, graph)| (NodePos::new(pos, value.clone()), *graph))
        })
    }

    pub fn graph_of(&self, node: &NodePos) -> Option<GraphId> {
        self.nodes
            .get(&node.pos.local_index())?
            .iter()
            .find(|(value, _)| *value == node.node)
            .map(|(_, graph)| *graph)
    }

    /// Record `node` as belonging to `graph`, replacing any previous owner.
    pub fn put_node(&mut self, node: &NodePos, graph: GraphId) {
        let entries = self.nodes.entry(node.pos.local_index()).or_default();
        match entries.iter_mut().find(|(value, _)| *value == node.node) {
            Some(entry) => {
                let previous = std::mem::replace(&mut entry.1, graph);
                if previous == graph {
                    return;
                }
                decrement(&mut self.graphs, previous);
            }
            None => entries.push((node.node.clone(), graph)),
        }
        *self.graphs.entry(graph).or_insert(0) += 1;
    }

    pub fn remove_node(&mut self, node: &NodePos) -> Option<GraphId> {
        let local = node.pos.local_index();
        let entries = self.nodes.get_mut(&local)?;
        let idx = entries.iter().position(|(value, _)| *value == node.node)?;
        let (_, graph) = entries.remove(idx);
        if entries.is_empty() {
            self.nodes.remove(&local);
        }
        decrement(&mut self.graphs, graph);
        Some(graph)
    }

    /// Drop every node owned by `graph`. Returns how many were removed.
    pub fn remove_graph(&mut self, graph: GraphId) -> usize {
        if self.graphs.remove(&graph).is_none() {
            return 0;
        }
        let mut removed = 0;
        self.nodes.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(_, owner)| *owner != graph);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.graphs.clear();
    }
}

fn decrement(graphs: &mut BTreeMap<GraphId, u32>, graph: GraphId) {
    if let Some(count) = graphs.get_mut(&graph) {
        *count -= 1;
        if *count == 0 {
            graphs.remove(&graph);
        }
    }
}

impl RegionSection for GraphChunk {
    type Context = Universe;

    fn empty(pos: SectionPos) -> Self {
        Self { pos, nodes: BTreeMap::new(), graphs: BTreeMap::new() }
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn encode(&self) -> Result<Value> {
        let mut nodes = Vec::with_capacity(self.node_count());
        for (local, entries) in &self.nodes {
            for (value, graph) in entries {
                let record = ChunkNodeRecord {
                    pos: *local,
                    graph: *graph,
                    type_tag: value.type_tag(),
                    data: value.get().encode(),
                };
                nodes.push(serde_json::to_value(record)?);
            }
        }
        Ok(serde_json::to_value(ChunkRecord { nodes })?)
    }

    fn decode(pos: SectionPos, data: Value, universe: &Universe) -> Result<Self> {
        let record: ChunkRecord = serde_json::from_value(data)?;
        let mut chunk = Self::empty(pos);
        for entry in record.nodes {
            let entry: ChunkNodeRecord = match serde_json::from_value(entry) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(section = %pos, error = %e, "skipping malformed node entry");
                    continue;
                }
            };
            let Some(value) = universe.decode_node(&entry.type_tag, &entry.data) else {
                continue;
            };
            let node = NodePos::new(pos.block_at(entry.pos), value);
            chunk.put_node(&node, entry.graph);
        }
        Ok(chunk)
    }
}
