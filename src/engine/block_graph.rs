//! A connectivity graph with an id, placed in the world.

use std::collections::BTreeMap;

use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use super::entity::{GraphEntity, LinkEntity, NodeEntity};
use crate::graph::Graph;
use crate::{Error, Result};
use crate::model::{
    BlockPos, GraphId, LinkKeyValue, LinkPos, NodePos, SectionPos, TypeTag,
};
use crate::registry::Universe;

pub type NodeGraph = Graph<NodePos, (), LinkKeyValue>;

/// One connected component of a universe, with its sections and entities.
///
/// All mutation goes through [`super::GraphWorld`], which keeps the section
/// index consistent with the node set.
#[derive(Debug)]
pub struct BlockGraph {
    id: GraphId,
    graph: NodeGraph,
    by_pos: HashMap<BlockPos, SmallVec<[NodePos; 2]>>,
    sections: BTreeMap<SectionPos, u32>,
    entities: BTreeMap<TypeTag, Box<dyn GraphEntity>>,
    node_entities: HashMap<NodePos, Box<dyn NodeEntity>>,
    link_entities: HashMap<LinkPos, Box<dyn LinkEntity>>,
}

impl BlockGraph {
    pub(crate) fn new(id: GraphId, universe: &Universe) -> Self {
        let mut graph = Self::bare(id);
        graph.fill_entities(universe);
        graph
    }

    fn bare(id: GraphId) -> Self {
        Self {
            id,
            graph: Graph::new(),
            by_pos: HashMap::new(),
            sections: BTreeMap::new(),
            entities: BTreeMap::new(),
            node_entities: HashMap::new(),
            link_entities: HashMap::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn contains(&self, node: &NodePos) -> bool {
        self.graph.contains(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodePos> + '_ {
        self.graph.keys()
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkPos> + '_ {
        self.graph.links()
    }

    pub fn link_count(&self) -> usize {
        self.graph.links().count()
    }

    pub fn nodes_at(&self, pos: BlockPos) -> &[NodePos] {
        self.by_pos.get(&pos).map_or(&[], SmallVec::as_slice)
    }

    pub fn connections(&self, node: &NodePos) -> &[LinkPos] {
        self.graph.get(node).map_or(&[], |n| n.links())
    }

    /// Sections holding at least one node.
    pub fn sections(&self) -> impl Iterator<Item = SectionPos> + '_ {
        self.sections.keys().copied()
    }

    pub fn entity(&self, tag: &TypeTag) -> Option<&dyn GraphEntity> {
        self.entities.get(tag).map(|e| &**e)
    }

    pub fn entity_as<E: GraphEntity>(&self, tag: &TypeTag) -> Option<&E> {
        let entity: &dyn GraphEntity = &**self.entities.get(tag)?;
        entity.as_any().downcast_ref::<E>()
    }

    pub fn entity_as_mut<E: GraphEntity>(&mut self, tag: &TypeTag) -> Option<&mut E> {
        let entity: &mut dyn GraphEntity = &mut **self.entities.get_mut(tag)?;
        entity.as_any_mut().downcast_mut::<E>()
    }

    pub fn node_entity(&self, node: &NodePos) -> Option<&dyn NodeEntity> {
        self.node_entities.get(node).map(|e| &**e)
    }

    pub fn node_entity_as<E: NodeEntity>(&self, node: &NodePos) -> Option<&E> {
        self.node_entity(node)?.as_any().downcast_ref::<E>()
    }

    pub fn node_entity_as_mut<E: NodeEntity>(&mut self, node: &NodePos) -> Option<&mut E> {
        let entity: &mut dyn NodeEntity = &mut **self.node_entities.get_mut(node)?;
        entity.as_any_mut().downcast_mut::<E>()
    }

    pub fn link_entity(&self, link: &LinkPos) -> Option<&dyn LinkEntity> {
        self.link_entities.get(link).map(|e| &**e)
    }

    pub fn link_entity_as<E: LinkEntity>(&self, link: &LinkPos) -> Option<&E> {
        self.link_entity(link)?.as_any().downcast_ref::<E>()
    }

    pub fn link_entity_as_mut<E: LinkEntity>(&mut self, link: &LinkPos) -> Option<&mut E> {
        let entity: &mut dyn LinkEntity = &mut **self.link_entities.get_mut(link)?;
        entity.as_any_mut().downcast_mut::<E>()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub(crate) fn add_node(&mut self, node: NodePos) -> bool {
        if !self.graph.add(node.clone(), ()) {
            return false;
        }
        self.index_node(&node);
        if let Some(mut entity) = node.node.get().create_node_entity(&node) {
            entity.on_added(&node);
            self.node_entities.insert(node.clone(), entity);
        }
        for entity in self.entities.values_mut() {
            entity.on_node_created(&node);
        }
        true
    }

    /// Remove a node with its links. Does not split.
    pub(crate) fn remove_node(&mut self, node: &NodePos) -> bool {
        let Some(removed) = self.graph.remove(node) else {
            return false;
        };
        self.unindex_node(node);
        for link in removed.links() {
            if let Some(mut entity) = self.link_entities.remove(link) {
                entity.on_delete();
            }
        }
        if let Some(mut entity) = self.node_entities.remove(node) {
            entity.on_delete();
        }
        for entity in self.entities.values_mut() {
            for link in removed.links() {
                entity.on_unlink(link);
            }
            entity.on_node_destroyed(node);
        }
        true
    }

    pub(crate) fn link(&mut self, a: &NodePos, b: &NodePos, key: LinkKeyValue) -> Option<LinkPos> {
        let link = self.graph.link(a, b, key)?;
        if let Some(mut entity) = link.key().get().create_link_entity(&link) {
            entity.on_added(&link);
            self.link_entities.insert(link.clone(), entity);
        }
        for entity in self.entities.values_mut() {
            entity.on_link(&link);
        }
        Some(link)
    }

    pub(crate) fn unlink(&mut self, a: &NodePos, b: &NodePos, key: &LinkKeyValue) -> Option<LinkPos> {
        let link = self.graph.unlink(a, b, key)?;
        if let Some(mut entity) = self.link_entities.remove(&link) {
            entity.on_delete();
        }
        for entity in self.entities.values_mut() {
            entity.on_unlink(&link);
        }
        Some(link)
    }

    /// Move everything from `other` into this graph. Entities with the same
    /// tag are merged, others are adopted.
    pub(crate) fn absorb(&mut self, mut other: BlockGraph) {
        self.graph.join(&mut other.graph);
        for (pos, nodes) in other.by_pos {
            let here = self.by_pos.entry(pos).or_default();
            for node in nodes {
                if !here.contains(&node) {
                    here.push(node);
                }
            }
        }
        for (section, count) in other.sections {
            *self.sections.entry(section).or_insert(0) += count;
        }
        self.node_entities.extend(other.node_entities);
        self.link_entities.extend(other.link_entities);
        for (tag, entity) in other.entities {
            match self.entities.get_mut(&tag) {
                Some(existing) => existing.merge(entity),
                None => {
                    self.entities.insert(tag, entity);
                }
            }
        }
    }

    /// Split into connected components. This graph keeps the largest one;
    /// the others are returned as raw node sets awaiting ids.
    pub(crate) fn split_components(&mut self) -> Vec<NodeGraph> {
        let parts = self.graph.split();
        if !parts.is_empty() {
            self.rebuild_index();
        }
        parts
    }

    /// A new graph holding `part`. Node and link entities move along, graph
    /// entities are derived from this graph's.
    pub(crate) fn spin_off(&mut self, id: GraphId, part: NodeGraph) -> BlockGraph {
        let mut graph = Self::bare(id);
        graph.graph = part;
        graph.rebuild_index();

        for node in graph.graph.keys() {
            if let Some(entity) = self.node_entities.remove(node) {
                graph.node_entities.insert(node.clone(), entity);
            }
        }
        for link in graph.graph.links() {
            if let Some(entity) = self.link_entities.remove(link) {
                graph.link_entities.insert(link.clone(), entity);
            }
        }

        for (tag, entity) in &self.entities {
            let derived = entity.split_new(self, &graph);
            graph.entities.insert(tag.clone(), derived);
        }
        graph
    }

    pub(crate) fn tick(&mut self) {
        let mut entities = std::mem::take(&mut self.entities);
        for entity in entities.values_mut() {
            entity.on_tick(self);
        }
        self.entities = entities;
    }

    /// The graph is about to leave memory.
    pub(crate) fn unload(&mut self) {
        for entity in self.node_entities.values_mut() {
            entity.on_unload();
        }
        for entity in self.link_entities.values_mut() {
            entity.on_unload();
        }
    }

    fn fill_entities(&mut self, universe: &Universe) {
        for entity_type in universe.entity_types() {
            if !self.entities.contains_key(entity_type.tag()) {
                self.entities.insert(entity_type.tag().clone(), entity_type.create());
            }
        }
    }

    fn index_node(&mut self, node: &NodePos) {
        self.by_pos.entry(node.pos).or_default().push(node.clone());
        *self.sections.entry(node.pos.section()).or_insert(0) += 1;
    }

    fn unindex_node(&mut self, node: &NodePos) {
        if let Some(nodes) = self.by_pos.get_mut(&node.pos) {
            nodes.retain(|n| n != node);
            if nodes.is_empty() {
                self.by_pos.remove(&node.pos);
            }
        }
        let section = node.pos.section();
        if let Some(count) = self.sections.get_mut(&section) {
            *count -= 1;
            if *count == 0 {
                self.sections.remove(&section);
            }
        }
    }

    fn rebuild_index(&mut self) {
        self.by_pos.clear();
        self.sections.clear();
        let nodes: Vec<NodePos> = self.graph.keys().cloned().collect();
        for node in &nodes {
            self.index_node(node);
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub(crate) fn encode(&self) -> Result<Bytes> {
        let mut index = HashMap::with_capacity(self.len());
        let mut nodes = Vec::with_capacity(self.len());
        for (i, node) in self.graph.keys().enumerate() {
            index.insert(node, i);
            let entity = self.node_entities.get(node).and_then(|e| self.encode_entity(e.type_tag(), e.encode()));
            nodes.push(serde_json::to_value(NodeRecord {
                pos: node.pos,
                type_tag: node.node.type_tag(),
                data: node.node.get().encode(),
                entity,
            })?);
        }

        let mut links = Vec::new();
        for link in self.graph.links() {
            let (Some(first), Some(second)) = (index.get(link.first()), index.get(link.second())) else {
                continue;
            };
            let entity = self.link_entities.get(link).and_then(|e| self.encode_entity(e.type_tag(), e.encode()));
            links.push(serde_json::to_value(LinkRecord {
                first: *first,
                second: *second,
                type_tag: link.key().type_tag(),
                data: link.key().get().encode(),
                entity,
            })?);
        }

        let mut entities = Vec::with_capacity(self.entities.len());
        for (tag, entity) in &self.entities {
            match entity.encode() {
                Ok(data) => entities.push(serde_json::to_value(TypedRecord { type_tag: tag.clone(), data })?),
                Err(e) => tracing::error!(graph = %self.id, tag = %tag, error = %e, "failed to encode graph entity, skipping"),
            }
        }

        let record = GraphRecord {
            id: self.id,
            sections: self.sections().collect(),
            nodes,
            links,
            entities,
        };
        Ok(Bytes::from(serde_json::to_vec(&record)?))
    }

    fn encode_entity(&self, tag: TypeTag, data: Result<Value>) -> Option<Value> {
        let encoded = data.and_then(|data| {
            serde_json::to_value(TypedRecord { type_tag: tag.clone(), data }).map_err(Error::from)
        });
        encoded
            .inspect_err(|e| tracing::error!(graph = %self.id, tag = %tag, error = %e, "failed to encode entity, skipping"))
            .ok()
    }

    /// Decode a persisted graph. Undecodable nodes, links and entities are
    /// dropped one by one with a warning; missing entities are recreated.
    pub(crate) fn decode(id: GraphId, blob: &[u8], universe: &Universe) -> Result<Self> {
        let record: GraphRecord = serde_json::from_slice(blob)?;
        if record.id != id {
            tracing::warn!(graph = %id, recorded = %record.id, "graph blob records a different id");
        }

        let mut graph = Self::bare(id);
        let mut by_index: Vec<Option<NodePos>> = Vec::with_capacity(record.nodes.len());
        for data in record.nodes {
            let Ok(node) = serde_json::from_value::<NodeRecord>(data)
                .inspect_err(|e| tracing::warn!(graph = %id, error = %e, "skipping malformed node"))
            else {
                by_index.push(None);
                continue;
            };
            let Some(value) = universe.decode_node(&node.type_tag, &node.data) else {
                by_index.push(None);
                continue;
            };
            let pos = NodePos::new(node.pos, value);
            if graph.graph.add(pos.clone(), ()) {
                let entity = node
                    .entity
                    .and_then(|data| decode_typed(id, data))
                    .and_then(|e| universe.decode_node_entity(&e.type_tag, &e.data))
                    .or_else(|| pos.node.get().create_node_entity(&pos));
                if let Some(mut entity) = entity {
                    entity.on_loaded(&pos);
                    graph.node_entities.insert(pos.clone(), entity);
                }
            } else {
                tracing::warn!(graph = %id, node = %pos, "duplicate node in graph blob");
            }
            by_index.push(Some(pos));
        }

        for data in record.links {
            let Ok(link) = serde_json::from_value::<LinkRecord>(data) else {
                tracing::warn!(graph = %id, "skipping malformed link");
                continue;
            };
            let endpoints = (
                by_index.get(link.first).and_then(Option::as_ref),
                by_index.get(link.second).and_then(Option::as_ref),
            );
            let (Some(first), Some(second)) = endpoints else {
                tracing::warn!(graph = %id, first = link.first, second = link.second, "link references a missing node, skipping");
                continue;
            };
            let Some(key) = universe.decode_link_key(&link.type_tag, &link.data) else {
                continue;
            };
            let Some(pos) = graph.graph.link(first, second, key) else {
                continue;
            };
            let entity = link
                .entity
                .and_then(|data| decode_typed(id, data))
                .and_then(|e| universe.decode_link_entity(&e.type_tag, &e.data))
                .or_else(|| pos.key().get().create_link_entity(&pos));
            if let Some(mut entity) = entity {
                entity.on_loaded(&pos);
                graph.link_entities.insert(pos, entity);
            }
        }
        graph.rebuild_index();

        for data in record.entities {
            let Some(entity) = decode_typed(id, data) else {
                continue;
            };
            let Some(entity_type) = universe.entity_type(&entity.type_tag) else {
                tracing::warn!(graph = %id, tag = %entity.type_tag, "unknown graph entity type, dropping");
                continue;
            };
            match entity_type.decode(&entity.data) {
                Ok(decoded) => {
                    graph.entities.insert(entity.type_tag, decoded);
                }
                Err(e) => tracing::warn!(graph = %id, tag = %entity.type_tag, error = %e, "undecodable graph entity, recreating"),
            }
        }
        graph.fill_entities(universe);
        Ok(graph)
    }
}

#[derive(Serialize, Deserialize)]
struct GraphRecord {
    id: GraphId,
    #[serde(default)]
    sections: Vec<SectionPos>,
    #[serde(default)]
    nodes: Vec<Value>,
    #[serde(default)]
    links: Vec<Value>,
    #[serde(default)]
    entities: Vec<Value>,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    pos: BlockPos,
    #[serde(rename = "type")]
    type_tag: TypeTag,
    #[serde(default)]
    data: Value,
    /// Kept raw so a bad entity drops only the entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct LinkRecord {
    first: usize,
    second: usize,
    #[serde(rename = "type")]
    type_tag: TypeTag,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct TypedRecord {
    #[serde(rename = "type")]
    type_tag: TypeTag,
    #[serde(default)]
    data: Value,
}

fn decode_typed(graph: GraphId, data: Value) -> Option<TypedRecord> {
    serde_json::from_value(data)
        .inspect_err(|e| tracing::warn!(graph = %graph, error = %e, "skipping malformed entity record"))
        .ok()
}
