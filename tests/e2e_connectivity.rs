//! End-to-end connectivity tests: discovery, merge and split, manual links,
//! change callbacks, graph entities, persistence and rebuilds.
//!
//! All worlds here run on a `MemoryBlobStore`. Engine calls block on the
//! storage worker, so these are plain `#[test]`s outside any runtime.

mod common;

use std::sync::Arc;

use blockgraph::engine::RebuildListener;
use blockgraph::model::{LinkKeyValue, SectionPos};
use blockgraph::storage::{BlobKey, SaveMode};
use blockgraph::{BlockPos, Error, GraphWorld, MemoryBlobStore, NodePos, StorageConfig, Universe};
use common::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

// ============================================================================
// Helpers
// ============================================================================

/// Place same-colour wires along x at y = z = 0.
fn chain(f: &mut Fixture, xs: impl IntoIterator<Item = i32>) -> Vec<NodePos> {
    xs.into_iter()
        .map(|x| {
            let node = wire(x, 0, 0);
            f.place(&node);
            node
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Rebuild {
    Begin(usize, usize),
    Progress,
    Complete(usize, usize),
    AlreadyRunning,
}

#[derive(Clone, Default)]
struct RebuildLog(Arc<Mutex<Vec<Rebuild>>>);

impl RebuildLog {
    fn events(&self) -> Vec<Rebuild> {
        self.0.lock().clone()
    }
}

impl RebuildListener for RebuildLog {
    fn on_begin(&mut self, graphs: usize, sections: usize) {
        self.0.lock().push(Rebuild::Begin(graphs, sections));
    }

    fn on_progress(&mut self, _progress: f32, _graphs: usize, _sections: usize) {
        self.0.lock().push(Rebuild::Progress);
    }

    fn on_complete(&mut self, graphs: usize, sections: usize) {
        self.0.lock().push(Rebuild::Complete(graphs, sections));
    }

    fn on_already_running(&mut self, _progress: f32, _graphs: usize, _sections: usize) {
        self.0.lock().push(Rebuild::AlreadyRunning);
    }
}

// ============================================================================
// 1. A node appears, a neighbour joins it, the first one disappears
// ============================================================================

#[test]
fn test_discover_join_and_remove() {
    let mut f = fixture();
    let x = wire(0, 64, 0);
    let y = wire(1, 64, 0);

    f.place(&x);
    let gx = f.graph_of(&x);
    assert_eq!(f.graph_len(gx), 1);

    f.place(&y);
    let gy = f.graph_of(&y);
    assert_eq!(f.graph_of(&x), gy);
    let graph = f.world.graph(gy).unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.link_count(), 1);

    f.clear(x.pos);
    assert_eq!(f.world.graph_id_at(&x), None);
    assert!(f.world.nodes_at(x.pos).is_empty());
    let gy = f.graph_of(&y);
    let graph = f.world.graph(gy).unwrap();
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.link_count(), 0);
    assert!(graph.contains(&y));
}

// ============================================================================
// 2. A straight run of wire is one graph
// ============================================================================

#[test]
fn test_chain_is_one_graph() {
    let mut f = fixture();
    let nodes = chain(&mut f, 0..6);

    let id = f.graph_of(&nodes[0]);
    for node in &nodes {
        assert_eq!(f.graph_of(node), id);
    }
    let graph = f.world.graph(id).unwrap();
    assert_eq!(graph.len(), 6);
    assert_eq!(graph.link_count(), 5);
    assert_eq!(f.world.loaded_graph_ids(), vec![id]);
}

// ============================================================================
// 3. Different colours never join
// ============================================================================

#[test]
fn test_different_colours_stay_apart() {
    let mut f = fixture();
    let red = NodePos::new(BlockPos::new(0, 0, 0), wire_value(1));
    let blue = NodePos::new(BlockPos::new(1, 0, 0), wire_value(2));
    f.place(&red);
    f.place(&blue);

    assert_ne!(f.graph_of(&red), f.graph_of(&blue));
    assert!(f.world.connections(&red).is_empty());
}

// ============================================================================
// 4. Two coexisting nodes at one position
// ============================================================================

#[test]
fn test_two_nodes_share_a_position() {
    let mut f = fixture();
    let pos = BlockPos::new(5, 5, 5);
    let red = NodePos::new(pos, wire_value(1));
    let blue = NodePos::new(pos, wire_value(2));
    f.place(&red);
    f.place(&blue);

    let mut at = f.world.nodes_at(pos);
    at.sort_by_key(|n| n.node.downcast_ref::<Wire>().map(|w| w.color));
    assert_eq!(at, vec![red.clone(), blue.clone()]);
    assert_ne!(f.graph_of(&red), f.graph_of(&blue));

    // Rediscovering the same values changes nothing.
    let before = f.world.loaded_graph_ids();
    f.world.update_nodes(pos).unwrap();
    assert_eq!(f.world.loaded_graph_ids(), before);
}

// ============================================================================
// 5. Merge keeps the larger graph's id
// ============================================================================

#[test]
fn test_merge_keeps_larger_id() {
    let mut f = fixture();
    let a = chain(&mut f, 0..3);
    let b = chain(&mut f, [4]);
    let ga = f.graph_of(&a[0]);
    let gb = f.graph_of(&b[0]);
    assert_ne!(ga, gb);
    f.listener.take();

    chain(&mut f, [3]);

    assert_eq!(f.graph_of(&b[0]), ga);
    assert_eq!(f.graph_len(ga), 5);
    assert!(f.world.loaded_graph(gb).is_none());
    assert!(f.listener.take().contains(&Event::Destroyed(gb)));
}

// ============================================================================
// 6. Removing a bridge splits; the largest part keeps the id
// ============================================================================

#[test]
fn test_split_largest_keeps_id() {
    let mut f = fixture();
    let nodes = chain(&mut f, 0..5);
    let id = f.graph_of(&nodes[0]);
    f.listener.take();

    f.clear(nodes[1].pos);

    assert_eq!(f.graph_of(&nodes[2]), id);
    assert_eq!(f.graph_len(id), 3);
    let lone = f.graph_of(&nodes[0]);
    assert_ne!(lone, id);
    assert_eq!(f.graph_len(lone), 1);
    assert!(lone > id);
    assert!(f.listener.take().contains(&Event::Created(lone)));
}

// ============================================================================
// 7. Manual links survive connection refreshes
// ============================================================================

#[test]
fn test_manual_link_survives_refresh() {
    let mut f = fixture();
    let red = NodePos::new(BlockPos::new(0, 0, 0), wire_value(1));
    let blue = NodePos::new(BlockPos::new(3, 0, 0), wire_value(2));
    f.place(&red);
    f.place(&blue);

    assert!(f.world.connect(&red, &blue, LinkKeyValue::manual()).unwrap());
    assert!(!f.world.connect(&red, &blue, LinkKeyValue::manual()).unwrap());
    let id = f.graph_of(&red);
    assert_eq!(f.graph_of(&blue), id);

    f.world.update_connections(red.pos).unwrap();
    f.world.update_connections(blue.pos).unwrap();
    assert_eq!(f.world.connections(&red).len(), 1);
    assert_eq!(f.graph_of(&blue), id);

    assert!(f.world.disconnect(&red, &blue, &LinkKeyValue::manual()).unwrap());
    assert_ne!(f.graph_of(&red), f.graph_of(&blue));
}

// ============================================================================
// 8. Linking a node to itself or to nothing
// ============================================================================

#[test]
fn test_connect_rejects_self_and_missing() {
    let mut f = fixture();
    let a = wire(0, 0, 0);
    f.place(&a);

    assert!(!f.world.connect(&a, &a, LinkKeyValue::manual()).unwrap());
    assert!(!f.world.connect(&a, &wire(9, 9, 9), LinkKeyValue::manual()).unwrap());
    assert!(f.world.connections(&a).is_empty());
}

// ============================================================================
// 9. One-sided connection checks make no link
// ============================================================================

#[test]
fn test_asymmetric_check_makes_no_link() {
    let mut f = fixture();
    let w = wire(0, 0, 0);
    let sensor = NodePos::new(BlockPos::new(1, 0, 0), blockgraph::NodeValue::new(Sensor));
    f.place(&w);
    f.place(&sensor);

    assert!(f.world.connections(&sensor).is_empty());
    assert!(f.world.connections(&w).is_empty());
    assert_ne!(f.graph_of(&w), f.graph_of(&sensor));
}

// ============================================================================
// 10. Connection callbacks fire once per changed node per batch
// ============================================================================

#[test]
fn test_connection_change_fires_once_per_node() {
    let mut f = fixture();
    let ends = chain(&mut f, [0, 2]);
    f.listener.take();

    let middle = chain(&mut f, [1]).remove(0);

    let changed = f.listener.changed();
    assert_eq!(changed.len(), 3);
    for node in [&ends[0], &middle, &ends[1]] {
        assert_eq!(changed.iter().filter(|n| *n == node).count(), 1);
    }

    // No change, no callback.
    f.listener.take();
    f.world.update_connections(middle.pos).unwrap();
    assert!(f.listener.changed().is_empty());
}

// ============================================================================
// 11. Batched updates and scheduled updates
// ============================================================================

#[test]
fn test_batched_and_scheduled_updates() {
    let mut f = fixture();
    for x in 0..4 {
        f.discoverer.place(BlockPos::new(x, 0, 0), wire_value(0));
    }

    let visited = f.world.update_nodes_batch((0..4).map(|x| BlockPos::new(x, 0, 0))).unwrap();
    assert_eq!(visited, 4);
    let id = f.graph_of(&wire(0, 0, 0));
    assert_eq!(f.graph_len(id), 4);

    f.discoverer.place(BlockPos::new(4, 0, 0), wire_value(0));
    f.world.schedule_update(BlockPos::new(4, 0, 0)).unwrap();
    f.world.schedule_update(BlockPos::new(4, 0, 0)).unwrap();
    assert_eq!(f.world.graph_id_at(&wire(4, 0, 0)), None);

    f.world.tick().unwrap();
    assert_eq!(f.world.graph_id_at(&wire(4, 0, 0)), Some(id));
    assert_eq!(f.graph_len(id), 5);
}

// ============================================================================
// 12. Graph entities follow merges, splits and ticks
// ============================================================================

#[test]
fn test_entity_merge_split_and_tick() {
    let mut f = fixture();
    let nodes = chain(&mut f, 0..2);
    let id = f.graph_of(&nodes[0]);

    let census = f.world.graph(id).unwrap().entity_as::<Census>(&CENSUS).unwrap().clone();
    assert_eq!(census.merges, 1);
    assert_eq!(census.created, 2);

    f.world.tick().unwrap();
    f.world.tick().unwrap();
    let ticks = f.world.with_entity_mut::<Census, _>(id, &CENSUS, |c| c.ticks).unwrap();
    assert_eq!(ticks, 2);

    let nodes = [nodes, chain(&mut f, [2])].concat();
    f.clear(nodes[1].pos);

    let kept = f.world.graph(id).unwrap().entity_as::<Census>(&CENSUS).unwrap().clone();
    assert_eq!(kept.merges, 2);

    let other = [&nodes[0], &nodes[2]]
        .into_iter()
        .map(|n| f.graph_of(n))
        .find(|g| *g != id)
        .unwrap();
    let derived = f.world.graph(other).unwrap().entity_as::<Census>(&CENSUS).unwrap().clone();
    assert_eq!(derived.merges, 0);
    assert_eq!(derived.ticks, 2);
    assert_eq!(derived.created, 1);
}

// ============================================================================
// 13. Close and reopen over the same store
// ============================================================================

#[test]
fn test_persistence_round_trip() {
    let mut f = fixture();
    let nodes = chain(&mut f, 0..3);
    let id = f.graph_of(&nodes[0]);
    f.world.with_entity_mut::<Census, _>(id, &CENSUS, |c| c.ticks = 7).unwrap();
    f.world.close().unwrap();

    let mut g = fixture_with(f.store.clone(), StorageConfig::default(), SaveMode::Manual);
    assert_eq!(g.world.existing_graph_ids().into_iter().collect::<Vec<_>>(), vec![id]);
    for node in &nodes {
        assert_eq!(g.world.graph_id_at(node), Some(id));
    }
    let graph = g.world.graph(id).unwrap();
    assert_eq!(graph.len(), 3);
    assert_eq!(graph.link_count(), 2);
    assert_eq!(graph.entity_as::<Census>(&CENSUS).unwrap().ticks, 7);

    // Fresh ids never collide with stored ones.
    let far = wire(100, 0, 100);
    g.place(&far);
    assert!(g.graph_of(&far) > id);
}

// ============================================================================
// 14. Unknown node types are dropped on load; empty graphs are removed
// ============================================================================

#[test]
fn test_unknown_types_dropped_and_empty_graphs_removed() {
    let mut f = fixture();
    let nodes = chain(&mut f, 0..2);
    let id = f.graph_of(&nodes[0]);
    f.world.close().unwrap();
    assert!(f.store.get(&BlobKey::Graph(id)).is_some());

    // A universe that no longer knows about wires.
    let universe = Universe::builder("test")
        .node_type_serde::<Sensor>(SENSOR)
        .save_mode(SaveMode::Manual)
        .build()
        .unwrap();
    let mut world = GraphWorld::open(universe, Arc::new(f.store.clone()), StorageConfig::default()).unwrap();

    assert!(world.nodes_at(nodes[0].pos).is_empty());
    assert_eq!(world.remove_empty_graphs().unwrap(), 1);
    assert!(world.existing_graph_ids().is_empty());
    world.close().unwrap();
    assert_eq!(f.store.get(&BlobKey::Graph(id)), None);
}

// ============================================================================
// 15. Rebuilding the section index
// ============================================================================

#[test]
fn test_rebuild_restores_index_and_rediscovers() {
    let mut f = fixture();
    let nodes = chain(&mut f, 0..3);
    let id = f.graph_of(&nodes[0]);
    // Known to discovery but never updated.
    f.discoverer.place(BlockPos::new(3, 0, 0), wire_value(0));

    let log = RebuildLog::default();
    f.world.rebuild_chunks([SectionPos::new(0, 0, 0)], Box::new(log.clone())).unwrap();
    assert!(f.world.is_rebuilding());
    assert!(f.world.nodes_at(nodes[0].pos).is_empty());

    let second = RebuildLog::default();
    f.world.rebuild_chunks([SectionPos::new(0, 0, 0)], Box::new(second.clone())).unwrap();
    assert_eq!(second.events(), vec![Rebuild::AlreadyRunning]);

    for _ in 0..10 {
        if !f.world.is_rebuilding() {
            break;
        }
        f.world.tick().unwrap();
    }
    assert!(!f.world.is_rebuilding());

    let events = log.events();
    assert_eq!(events.first(), Some(&Rebuild::Begin(1, 1)));
    assert_eq!(events.last(), Some(&Rebuild::Complete(1, 1)));
    assert!(!events.contains(&Rebuild::AlreadyRunning));

    for node in &nodes {
        assert_eq!(f.world.graph_id_at(node), Some(id));
    }
    assert_eq!(f.world.graph_id_at(&wire(3, 0, 0)), Some(id));
    assert_eq!(f.graph_len(id), 4);
}

// ============================================================================
// 16. A closed world refuses work
// ============================================================================

#[test]
fn test_closed_world_refuses_work() {
    let mut f = fixture();
    chain(&mut f, [0]);
    f.world.close().unwrap();
    assert!(f.world.is_closed());

    assert!(matches!(f.world.update_nodes(BlockPos::new(0, 0, 0)), Err(Error::Closed)));
    assert!(matches!(f.world.tick(), Err(Error::Closed)));
    assert!(matches!(f.world.save_all(), Err(Error::Closed)));
    // Closing twice is fine.
    f.world.close().unwrap();
}

// ============================================================================
// 17. Store contents after a manual save
// ============================================================================

#[test]
fn test_manual_mode_writes_only_on_save() {
    let store = MemoryBlobStore::new();
    let mut f = fixture_with(store.clone(), StorageConfig::default(), SaveMode::Manual);
    let nodes = chain(&mut f, 0..2);
    let id = f.graph_of(&nodes[0]);

    for _ in 0..5 {
        f.world.tick().unwrap();
    }
    assert_eq!(store.get(&BlobKey::Graph(id)), None);

    f.world.close().unwrap();
    assert!(store.get(&BlobKey::Graph(id)).is_some());
    assert!(store.get(&BlobKey::State).is_some());
    assert!(store.get(&BlobKey::Region(nodes[0].pos.column())).is_some());
}
