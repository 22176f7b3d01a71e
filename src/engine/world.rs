//! # GraphWorld
//!
//! The connectivity engine for one universe. It owns:
//!
//! | Part | Purpose |
//! |------|---------|
//! | `loaded` | Resident [`BlockGraph`]s by id |
//! | `chunks` | Section index: node → owning graph, per section |
//! | `timer` | Which columns keep graphs resident |
//! | `changes` | Link snapshots for the running batch |
//!
//! Every public mutation is one batch. Connection-change callbacks fire at
//! the end of the batch, once per node whose link set actually differs from
//! its state at the start.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use super::chunk::GraphChunk;
use super::context::NodeContext;
use super::events::WorldListener;
use super::rebuild::RebuildState;
use super::{BlockGraph, GraphEntity, LinkEntity, NodeEntity};
use crate::model::{
    BlockPos, ColumnPos, GraphId, HalfLink, LinkKeyValue, LinkPos, NodePos, SectionPos, TypeTag,
};
use crate::registry::Universe;
use crate::storage::{
    BlobKey, BlobKind, BlobStore, RegionStore, SaveMode, StorageConfig, StorageWorker,
};
use crate::timer::UnloadTimer;
use crate::{Error, Result};

#[derive(Serialize, Deserialize)]
struct WorldState {
    prev_graph_id: u64,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
}

/// Link sets captured before the first edit of each node in a batch.
#[derive(Default)]
struct ChangeBatch {
    order: Vec<NodePos>,
    before: HashMap<NodePos, HashSet<LinkPos>>,
    updated: BTreeSet<GraphId>,
}

enum Load {
    Resident,
    Missing,
    Empty,
    Failed,
}

pub struct GraphWorld {
    pub(super) universe: Arc<Universe>,
    pub(super) config: StorageConfig,
    worker: Arc<StorageWorker>,
    pub(super) chunks: RegionStore<GraphChunk>,
    timer: UnloadTimer<ColumnPos>,
    pub(super) loaded: BTreeMap<GraphId, BlockGraph>,
    unsaved: BTreeSet<GraphId>,
    persisted: BTreeSet<GraphId>,
    prev_graph_id: u64,
    state_dirty: bool,
    scheduled: Vec<BlockPos>,
    scheduled_set: HashSet<BlockPos>,
    changes: ChangeBatch,
    pub(super) rebuild: Option<RebuildState>,
    save_cursor: Option<GraphId>,
    closed: bool,
}

impl GraphWorld {
    /// Open the universe's data in `store`. Lists persisted graphs and
    /// restores the id counter.
    pub fn open(universe: Arc<Universe>, store: Arc<dyn BlobStore>, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let worker = Arc::new(StorageWorker::spawn(format!("blockgraph-{}", universe.id()), store)?);

        let persisted: BTreeSet<GraphId> = worker
            .list_blocking(BlobKind::Graph)?
            .into_iter()
            .filter_map(|key| match key {
                BlobKey::Graph(id) => Some(id),
                _ => None,
            })
            .collect();

        let state = match worker.read_blocking(BlobKey::State)? {
            Some(blob) => serde_json::from_slice::<WorldState>(&blob)
                .inspect_err(|e| tracing::warn!(universe = %universe.id(), error = %e, "undecodable world state, starting id counter from stored graphs"))
                .ok(),
            None => None,
        };
        let prev_graph_id = state
            .as_ref()
            .map_or(0, |s| s.prev_graph_id)
            .max(persisted.last().map_or(0, |id| id.0));

        tracing::debug!(
            universe = %universe.id(),
            graphs = persisted.len(),
            prev_graph_id,
            saved_at = ?state.and_then(|s| s.saved_at),
            "opened graph world"
        );

        let chunks = RegionStore::new(worker.clone(), universe.clone(), &config, universe.save_mode());
        Ok(Self {
            timer: UnloadTimer::new(config.max_age_ticks),
            universe,
            config,
            worker,
            chunks,
            loaded: BTreeMap::new(),
            unsaved: BTreeSet::new(),
            persisted,
            prev_graph_id,
            state_dirty: false,
            scheduled: Vec::new(),
            scheduled_set: HashSet::new(),
            changes: ChangeBatch::default(),
            rebuild: None,
            save_cursor: None,
            closed: false,
        })
    }

    pub fn universe(&self) -> &Arc<Universe> {
        &self.universe
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn region_store(&self) -> &RegionStore<GraphChunk> {
        &self.chunks
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Diff discovery against the nodes stored at `pos` and apply the
    /// result as one batch.
    pub fn update_nodes(&mut self, pos: BlockPos) -> Result<()> {
        self.ensure_open()?;
        self.update_nodes_inner(pos);
        self.flush_changes();
        Ok(())
    }

    /// Run discovery for many positions as a single batch.
    pub fn update_nodes_batch(&mut self, positions: impl IntoIterator<Item = BlockPos>) -> Result<usize> {
        self.ensure_open()?;
        let mut count = 0;
        for pos in positions {
            self.update_nodes_inner(pos);
            count += 1;
        }
        self.flush_changes();
        Ok(count)
    }

    /// Queue `pos` for the batch run on the next [`GraphWorld::tick`].
    pub fn schedule_update(&mut self, pos: BlockPos) -> Result<()> {
        self.ensure_open()?;
        if self.scheduled_set.insert(pos) {
            self.scheduled.push(pos);
        }
        Ok(())
    }

    /// Recompute the links of every node at `pos`.
    pub fn update_connections(&mut self, pos: BlockPos) -> Result<()> {
        self.ensure_open()?;
        for node in self.live_nodes_at(pos) {
            self.refresh_connections(&node);
        }
        self.flush_changes();
        Ok(())
    }

    /// Link two existing nodes directly. Returns `false` when either node is
    /// missing or the link already exists.
    pub fn connect(&mut self, a: &NodePos, b: &NodePos, key: LinkKeyValue) -> Result<bool> {
        self.ensure_open()?;
        if a == b {
            tracing::warn!(node = %a, "refusing to link a node to itself");
            return Ok(false);
        }
        let linked = self.link_nodes(a, b, key);
        self.flush_changes();
        Ok(linked)
    }

    pub fn disconnect(&mut self, a: &NodePos, b: &NodePos, key: &LinkKeyValue) -> Result<bool> {
        self.ensure_open()?;
        let unlinked = self.unlink_nodes(a, b, key);
        if unlinked {
            if let Some(id) = self.graph_id_at(a) {
                self.split_graph(id);
            }
        }
        self.flush_changes();
        Ok(unlinked)
    }

    /// Destroy every graph without nodes, loading stored graphs to check.
    pub fn remove_empty_graphs(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let mut removed = 0;
        for id in self.existing_graph_ids() {
            if let Some(graph) = self.loaded.get(&id) {
                if graph.is_empty() {
                    self.destroy_graph(id);
                    removed += 1;
                }
                continue;
            }
            if let Load::Empty = self.load_graph(id) {
                removed += 1;
            }
        }
        tracing::debug!(universe = %self.universe.id(), removed, "removed empty graphs");
        Ok(removed)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn nodes_at(&mut self, pos: BlockPos) -> Vec<NodePos> {
        self.chunks
            .get_if_exists(pos.section())
            .map(|chunk| chunk.nodes_at(pos).map(|(node, _)| node).collect())
            .unwrap_or_default()
    }

    pub fn graph_id_at(&mut self, node: &NodePos) -> Option<GraphId> {
        self.chunks.get_if_exists(node.pos.section())?.graph_of(node)
    }

    pub fn graph_ids_in_section(&mut self, pos: SectionPos) -> Vec<GraphId> {
        self.chunks
            .get_if_exists(pos)
            .map(|chunk| chunk.graph_ids().collect())
            .unwrap_or_default()
    }

    /// A graph by id, loading it when needed.
    pub fn graph(&mut self, id: GraphId) -> Option<&BlockGraph> {
        if !self.ensure_loaded(id) {
            return None;
        }
        self.loaded.get(&id)
    }

    pub fn require_graph(&mut self, id: GraphId) -> Result<&BlockGraph> {
        self.graph(id).ok_or(Error::GraphNotFound(id))
    }

    /// The graph owning `node`.
    pub fn graph_at(&mut self, node: &NodePos) -> Option<&BlockGraph> {
        let id = self.graph_id_at(node)?;
        self.graph(id)
    }

    pub fn loaded_graph(&self, id: GraphId) -> Option<&BlockGraph> {
        self.loaded.get(&id)
    }

    pub fn loaded_graph_ids(&self) -> Vec<GraphId> {
        self.loaded.keys().copied().collect()
    }

    /// Ids of every graph, stored or resident.
    pub fn existing_graph_ids(&self) -> BTreeSet<GraphId> {
        self.persisted.iter().chain(self.loaded.keys()).copied().collect()
    }

    pub fn connections(&mut self, node: &NodePos) -> Vec<LinkPos> {
        match self.graph_at(node) {
            Some(graph) => graph.connections(node).to_vec(),
            None => Vec::new(),
        }
    }

    /// Run `f` on a graph entity and mark the graph for saving.
    pub fn with_entity_mut<E, R>(&mut self, id: GraphId, tag: &TypeTag, f: impl FnOnce(&mut E) -> R) -> Option<R>
    where
        E: GraphEntity,
    {
        if !self.ensure_loaded(id) {
            return None;
        }
        let result = f(self.loaded.get_mut(&id)?.entity_as_mut::<E>(tag)?);
        self.unsaved.insert(id);
        Some(result)
    }

    /// Run `f` on the entity of `node` and mark its graph for saving.
    pub fn with_node_entity_mut<E, R>(&mut self, node: &NodePos, f: impl FnOnce(&mut E) -> R) -> Option<R>
    where
        E: NodeEntity,
    {
        let id = self.graph_id_at(node)?;
        if !self.ensure_loaded(id) {
            return None;
        }
        let result = f(self.loaded.get_mut(&id)?.node_entity_as_mut::<E>(node)?);
        self.unsaved.insert(id);
        Some(result)
    }

    /// Run `f` on the entity of `link` and mark its graph for saving.
    pub fn with_link_entity_mut<E, R>(&mut self, link: &LinkPos, f: impl FnOnce(&mut E) -> R) -> Option<R>
    where
        E: LinkEntity,
    {
        let id = self.graph_id_at(link.first())?;
        if !self.ensure_loaded(id) {
            return None;
        }
        let result = f(self.loaded.get_mut(&id)?.link_entity_as_mut::<E>(link)?);
        self.unsaved.insert(id);
        Some(result)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Pin a host-loaded column and bring its graphs into memory.
    pub fn on_world_column_load(&mut self, column: ColumnPos) -> Result<()> {
        self.ensure_open()?;
        self.chunks.on_world_column_load(column);
        self.timer.on_pin(&column);

        let mut ids = BTreeSet::new();
        for y in self.config.section_range() {
            if let Some(chunk) = self.chunks.get_if_exists(column.section(y)) {
                ids.extend(chunk.graph_ids());
            }
        }
        for id in ids {
            self.ensure_loaded(id);
        }
        Ok(())
    }

    pub fn on_world_column_unload(&mut self, column: ColumnPos) -> Result<()> {
        self.ensure_open()?;
        self.chunks.on_world_column_unload(column);
        self.timer.on_unpin(&column);
        Ok(())
    }

    /// One simulation tick: rebuild progress, queued updates, entity ticks,
    /// graph unloading and the save policy.
    pub fn tick(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.continue_rebuild();

        let scheduled = std::mem::take(&mut self.scheduled);
        self.scheduled_set.clear();
        for pos in scheduled {
            self.update_nodes_inner(pos);
        }
        self.flush_changes();

        for graph in self.loaded.values_mut() {
            graph.tick();
        }

        self.timer.tick();
        let due = self.timer.due_for_eviction();
        if !due.is_empty() {
            for column in &due {
                self.timer.forget(column);
            }
            self.unload_idle_graphs();
        }

        let report = self.chunks.tick();
        if report.evicted > 0 || report.flushed > 0 {
            tracing::trace!(universe = %self.universe.id(), evicted = report.evicted, flushed = report.flushed, "region housekeeping");
        }
        self.apply_save_policy();
        Ok(())
    }

    /// Save one column's index data and the unsaved graphs touching it.
    pub fn save_chunk(&mut self, column: ColumnPos) -> Result<()> {
        self.ensure_open()?;
        let touching: Vec<GraphId> = self
            .unsaved
            .iter()
            .copied()
            .filter(|id| {
                self.loaded
                    .get(id)
                    .is_some_and(|g| g.sections().any(|s| s.column() == column))
            })
            .collect();
        for id in touching {
            self.save_graph(id)?;
        }
        self.chunks.save_chunk(column)
    }

    pub fn save_all(&mut self) -> Result<()> {
        self.ensure_open()?;
        let unsaved: Vec<GraphId> = self.unsaved.iter().copied().collect();
        for id in unsaved {
            self.save_graph(id)?;
        }
        self.save_state()?;
        self.chunks.save_all()
    }

    /// Save everything and wait for the writes. Later calls fail with
    /// [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.save_all()?;
        self.chunks.close()?;
        self.closed = true;
        tracing::debug!(universe = %self.universe.id(), graphs = self.persisted.len(), "closed graph world");
        Ok(())
    }

    // ========================================================================
    // Discovery and linking
    // ========================================================================

    pub(super) fn update_nodes_inner(&mut self, pos: BlockPos) {
        let discovered = self.universe.discover(pos);
        let present = self.live_nodes_at(pos);

        for node in &present {
            if node.node.get().is_automatic_removal() && !discovered.contains(&node.node) {
                self.destroy_node(node);
            }
        }

        let mut created = Vec::new();
        for value in discovered {
            let node = NodePos::new(pos, value);
            if !present.contains(&node) && self.create_node(node.clone()) {
                created.push(node);
            }
        }
        for node in &created {
            self.refresh_connections(node);
        }
    }

    /// Stored nodes at `pos` whose graph can be loaded. Index entries
    /// pointing at missing graphs are dropped. Entries whose graph failed
    /// to load are kept but skipped for this pass.
    pub(super) fn live_nodes_at(&mut self, pos: BlockPos) -> Vec<NodePos> {
        let entries: Vec<(NodePos, GraphId)> = self
            .chunks
            .get_if_exists(pos.section())
            .map(|chunk| chunk.nodes_at(pos).collect())
            .unwrap_or_default();

        let mut live = Vec::with_capacity(entries.len());
        for (node, id) in entries {
            match self.load_graph(id) {
                Load::Resident if self.loaded.get(&id).is_some_and(|g| g.contains(&node)) => live.push(node),
                Load::Failed => {
                    tracing::warn!(node = %node, graph = %id, "graph unavailable, skipping node this pass");
                }
                Load::Resident | Load::Missing | Load::Empty => {
                    tracing::warn!(node = %node, graph = %id, "index entry points at a missing graph, dropping");
                    self.index_remove(&node);
                }
            }
        }
        live
    }

    pub(super) fn refresh_connections(&mut self, node: &NodePos) {
        let Some(id) = self.graph_id_at(node) else { return };
        if !self.ensure_loaded(id) {
            return;
        }
        let current: Vec<LinkPos> = self
            .loaded
            .get(&id)
            .map(|g| g.connections(node).to_vec())
            .unwrap_or_default();

        let value = node.node.clone();
        let candidates = value.get().find_connections(&mut NodeContext::new(self, node.clone()));

        let mut wanted: Vec<(LinkPos, HalfLink)> = Vec::new();
        for half in candidates {
            if half.other == *node {
                tracing::warn!(node = %node, "node offered a link to itself, skipping");
                continue;
            }
            if self.graph_id_at(&half.other).is_none() {
                tracing::trace!(node = %node, other = %half.other, "connection candidate does not exist");
                continue;
            }
            let ours = value.get().can_connect(&mut NodeContext::new(self, node.clone()), &half);
            let other = half.other.node.clone();
            let reverse = half.reverse(node);
            let theirs = other.get().can_connect(&mut NodeContext::new(self, half.other.clone()), &reverse);
            match (ours, theirs) {
                (true, true) => {
                    let link = half.to_link_pos(node);
                    if !wanted.iter().any(|(l, _)| *l == link) {
                        wanted.push((link, half));
                    }
                }
                (false, false) => {}
                _ => tracing::warn!(
                    node = %node,
                    other = %half.other,
                    ours,
                    theirs,
                    "asymmetric connection check, skipping link"
                ),
            }
        }

        let mut unlinked = false;
        for link in &current {
            if wanted.iter().any(|(l, _)| l == link) {
                continue;
            }
            let Some(other) = link.other(node).cloned() else { continue };
            if !link.key().is_automatic_removal() && self.graph_id_at(&other).is_some() {
                continue;
            }
            unlinked |= self.unlink_nodes(node, &other, link.key());
        }

        for (link, half) in wanted {
            if !current.contains(&link) {
                self.link_nodes(node, &half.other, half.key);
            }
        }

        if unlinked {
            if let Some(id) = self.graph_id_at(node) {
                self.split_graph(id);
            }
        }
    }

    fn create_node(&mut self, node: NodePos) -> bool {
        if self.graph_id_at(&node).is_some() {
            return false;
        }
        let id = self.allocate_id();
        let mut graph = BlockGraph::new(id, &self.universe);
        graph.add_node(node.clone());
        self.loaded.insert(id, graph);
        self.index_put(&node, id);
        self.note_change(&node, None);
        self.mark_updated(id);
        self.notify(|l, u| l.on_graph_created(u, id));
        tracing::trace!(universe = %self.universe.id(), graph = %id, node = %node, "created node");
        true
    }

    fn destroy_node(&mut self, node: &NodePos) {
        let Some(id) = self.graph_id_at(node) else { return };
        match self.load_graph(id) {
            Load::Resident => {}
            Load::Failed => return,
            Load::Missing | Load::Empty => {
                self.index_remove(node);
                return;
            }
        }

        let neighbours: Vec<NodePos> = self
            .loaded
            .get(&id)
            .map(|g| g.connections(node).iter().filter_map(|l| l.other(node).cloned()).collect())
            .unwrap_or_default();
        self.note_change(node, Some(id));
        for neighbour in &neighbours {
            self.note_change(neighbour, Some(id));
        }

        if let Some(graph) = self.loaded.get_mut(&id) {
            graph.remove_node(node);
        }
        self.index_remove(node);
        tracing::trace!(universe = %self.universe.id(), graph = %id, node = %node, "destroyed node");

        if self.loaded.get(&id).is_some_and(BlockGraph::is_empty) {
            self.destroy_graph(id);
        } else {
            self.mark_updated(id);
            self.split_graph(id);
        }
    }

    fn link_nodes(&mut self, a: &NodePos, b: &NodePos, key: LinkKeyValue) -> bool {
        let (Some(ga), Some(gb)) = (self.graph_id_at(a), self.graph_id_at(b)) else {
            tracing::warn!(first = %a, second = %b, "cannot link nodes that do not exist");
            return false;
        };
        if !self.ensure_loaded(ga) || !self.ensure_loaded(gb) {
            return false;
        }
        self.note_change(a, Some(ga));
        self.note_change(b, Some(gb));

        let target = if ga == gb { ga } else { self.merge_graphs(ga, gb) };
        let linked = self
            .loaded
            .get_mut(&target)
            .and_then(|g| g.link(a, b, key))
            .is_some();
        if linked {
            self.mark_updated(target);
        }
        linked
    }

    fn unlink_nodes(&mut self, a: &NodePos, b: &NodePos, key: &LinkKeyValue) -> bool {
        let Some(id) = self.graph_id_at(a) else { return false };
        if self.graph_id_at(b) != Some(id) || !self.ensure_loaded(id) {
            return false;
        }
        self.note_change(a, Some(id));
        self.note_change(b, Some(id));

        let unlinked = self
            .loaded
            .get_mut(&id)
            .and_then(|g| g.unlink(a, b, key))
            .is_some();
        if unlinked {
            self.mark_updated(id);
        }
        unlinked
    }

    // ========================================================================
    // Merge / split
    // ========================================================================

    /// Join two graphs. The smaller moves into the larger, whose id
    /// survives; on equal size `a` survives.
    fn merge_graphs(&mut self, a: GraphId, b: GraphId) -> GraphId {
        let len = |id: GraphId| self.loaded.get(&id).map_or(0, BlockGraph::len);
        let (into, from) = if len(b) > len(a) { (b, a) } else { (a, b) };

        let Some(absorbed) = self.loaded.remove(&from) else { return into };
        for node in absorbed.nodes() {
            self.chunks.get_or_create(node.pos.section()).put_node(node, into);
        }
        let moved = absorbed.len();
        if let Some(target) = self.loaded.get_mut(&into) {
            target.absorb(absorbed);
        }
        self.forget_graph(from);
        self.mark_updated(into);
        tracing::debug!(universe = %self.universe.id(), into = %into, from = %from, moved, "merged graphs");
        into
    }

    /// Split `id` into connected components. The largest keeps the id,
    /// the rest get fresh ids.
    fn split_graph(&mut self, id: GraphId) {
        let parts = match self.loaded.get_mut(&id) {
            Some(graph) => graph.split_components(),
            None => return,
        };
        if parts.is_empty() {
            return;
        }

        let ids: Vec<GraphId> = parts.iter().map(|_| self.allocate_id()).collect();
        let Some(original) = self.loaded.get_mut(&id) else { return };
        let spun: Vec<BlockGraph> = parts
            .into_iter()
            .zip(ids)
            .map(|(part, new_id)| original.spin_off(new_id, part))
            .collect();

        tracing::debug!(universe = %self.universe.id(), graph = %id, parts = spun.len() + 1, "split graph");
        for graph in spun {
            let new_id = graph.id();
            for node in graph.nodes() {
                self.chunks.get_or_create(node.pos.section()).put_node(node, new_id);
            }
            self.loaded.insert(new_id, graph);
            self.mark_updated(new_id);
            self.notify(|l, u| l.on_graph_created(u, new_id));
        }
        self.mark_updated(id);
    }

    fn destroy_graph(&mut self, id: GraphId) {
        if let Some(graph) = self.loaded.remove(&id) {
            for section in graph.sections() {
                if let Some(mut chunk) = self.chunks.get_if_exists(section) {
                    if chunk.contains_graph(id) {
                        chunk.remove_graph(id);
                    }
                }
            }
        }
        self.forget_graph(id);
        tracing::debug!(universe = %self.universe.id(), graph = %id, "destroyed graph");
    }

    /// Drop a graph's persisted blob and bookkeeping.
    fn forget_graph(&mut self, id: GraphId) {
        self.unsaved.remove(&id);
        if self.persisted.remove(&id) {
            if let Err(e) = self.worker.write(BlobKey::Graph(id), None) {
                tracing::error!(universe = %self.universe.id(), graph = %id, error = %e, "failed to delete graph blob");
            }
        }
        self.notify(|l, u| l.on_graph_destroyed(u, id));
    }

    fn allocate_id(&mut self) -> GraphId {
        loop {
            self.prev_graph_id = self.prev_graph_id.wrapping_add(1);
            let id = GraphId(self.prev_graph_id);
            if !self.loaded.contains_key(&id) && !self.persisted.contains(&id) {
                self.state_dirty = true;
                return id;
            }
        }
    }

    // ========================================================================
    // Residency and persistence
    // ========================================================================

    fn ensure_loaded(&mut self, id: GraphId) -> bool {
        matches!(self.load_graph(id), Load::Resident)
    }

    fn load_graph(&mut self, id: GraphId) -> Load {
        if self.loaded.contains_key(&id) {
            return Load::Resident;
        }
        let blob = match self.worker.read_blocking(BlobKey::Graph(id)) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                tracing::debug!(universe = %self.universe.id(), graph = %id, "graph blob missing");
                self.persisted.remove(&id);
                return Load::Missing;
            }
            Err(e) => {
                tracing::error!(universe = %self.universe.id(), graph = %id, error = %e, "graph read failed");
                return Load::Failed;
            }
        };
        let graph = match BlockGraph::decode(id, &blob, &self.universe) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::error!(universe = %self.universe.id(), graph = %id, error = %e, "undecodable graph");
                return Load::Failed;
            }
        };

        self.persisted.insert(id);
        if graph.is_empty() {
            self.forget_graph(id);
            return Load::Empty;
        }
        for section in graph.sections() {
            self.timer.on_use(&section.column());
        }
        tracing::trace!(universe = %self.universe.id(), graph = %id, nodes = graph.len(), "loaded graph");
        self.loaded.insert(id, graph);
        Load::Resident
    }

    /// Save and drop graphs none of whose columns are tracked anymore.
    fn unload_idle_graphs(&mut self) {
        let idle: Vec<GraphId> = self
            .loaded
            .iter()
            .filter(|(_, graph)| !graph.sections().any(|s| self.timer.is_tracked(&s.column())))
            .map(|(id, _)| *id)
            .collect();

        for id in idle {
            if self.unsaved.contains(&id) {
                if let Err(e) = self.save_graph(id) {
                    tracing::error!(universe = %self.universe.id(), graph = %id, error = %e, "failed to save unloading graph");
                }
            }
            self.notify(|l, u| l.on_graph_unloading(u, id));
            if let Some(mut graph) = self.loaded.remove(&id) {
                graph.unload();
            }
            tracing::trace!(universe = %self.universe.id(), graph = %id, "unloaded graph");
        }
    }

    fn apply_save_policy(&mut self) {
        let mode = self.universe.save_mode();
        let mut unsaved: Vec<GraphId> = self.unsaved.iter().copied().collect();
        let budget = match mode {
            SaveMode::Manual => 0,
            SaveMode::Incremental => unsaved.len().div_ceil(self.config.incremental_save_factor.max(1)),
            SaveMode::Immediate => unsaved.len(),
        };

        if budget > 0 {
            if let Some(cursor) = self.save_cursor {
                let start = unsaved.partition_point(|id| *id <= cursor);
                unsaved.rotate_left(start);
            }
            for id in unsaved.into_iter().take(budget) {
                if let Err(e) = self.save_graph(id) {
                    tracing::error!(universe = %self.universe.id(), graph = %id, error = %e, "failed to save graph");
                }
                self.save_cursor = Some(id);
            }
        }

        if mode != SaveMode::Manual && self.state_dirty {
            if let Err(e) = self.save_state() {
                tracing::error!(universe = %self.universe.id(), error = %e, "failed to save world state");
            }
        }
    }

    fn save_graph(&mut self, id: GraphId) -> Result<()> {
        let Some(graph) = self.loaded.get(&id) else {
            self.unsaved.remove(&id);
            return Ok(());
        };
        let blob = graph.encode()?;
        self.worker.write(BlobKey::Graph(id), Some(blob))?;
        self.unsaved.remove(&id);
        self.persisted.insert(id);
        Ok(())
    }

    fn save_state(&mut self) -> Result<()> {
        let state = WorldState { prev_graph_id: self.prev_graph_id, saved_at: Some(Utc::now()) };
        let blob = serde_json::to_vec(&state)?;
        self.worker.write(BlobKey::State, Some(blob.into()))?;
        self.state_dirty = false;
        Ok(())
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    pub(super) fn index_put(&mut self, node: &NodePos, id: GraphId) {
        self.chunks.get_or_create(node.pos.section()).put_node(node, id);
        self.timer.on_use(&node.pos.column());
    }

    fn index_remove(&mut self, node: &NodePos) {
        if let Some(mut chunk) = self.chunks.get_if_exists(node.pos.section()) {
            chunk.remove_node(node);
        }
    }

    fn mark_updated(&mut self, id: GraphId) {
        self.unsaved.insert(id);
        self.changes.updated.insert(id);
    }

    /// Snapshot `node`'s links before its first edit in this batch.
    fn note_change(&mut self, node: &NodePos, graph: Option<GraphId>) {
        if self.changes.before.contains_key(node) {
            return;
        }
        let before: HashSet<LinkPos> = graph
            .and_then(|id| self.loaded.get(&id))
            .map(|g| g.connections(node).iter().cloned().collect())
            .unwrap_or_default();
        self.changes.before.insert(node.clone(), before);
        self.changes.order.push(node.clone());
    }

    pub(super) fn flush_changes(&mut self) {
        let batch = std::mem::take(&mut self.changes);
        let universe = self.universe.clone();

        for node in batch.order {
            if self.graph_id_at(&node).is_none() {
                continue;
            }
            let after: HashSet<LinkPos> = self.connections(&node).into_iter().collect();
            if batch.before.get(&node) == Some(&after) {
                continue;
            }
            let value = node.node.clone();
            value.get().on_connections_changed(&mut NodeContext::new(self, node.clone()));
            for listener in universe.listeners() {
                listener.on_connections_changed(universe.id(), &node);
            }
        }

        for id in batch.updated {
            if self.loaded.contains_key(&id) {
                for listener in universe.listeners() {
                    listener.on_graph_updated(universe.id(), id);
                }
            }
        }
    }

    fn notify(&self, f: impl Fn(&dyn WorldListener, &str)) {
        for listener in self.universe.listeners() {
            f(listener.as_ref(), self.universe.id());
        }
    }

    pub(super) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for GraphWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphWorld")
            .field("universe", &self.universe.id())
            .field("loaded", &self.loaded.len())
            .field("unsaved", &self.unsaved.len())
            .field("persisted", &self.persisted.len())
            .field("chunks", &self.chunks)
            .field("rebuilding", &self.rebuild.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
