//! The view a node gets of its world while deciding on connections.

use super::GraphWorld;
use crate::model::{BlockPos, GraphId, LinkPos, NodePos};
use crate::registry::Universe;

pub struct NodeContext<'w> {
    world: &'w mut GraphWorld,
    node: NodePos,
}

impl<'w> NodeContext<'w> {
    pub(crate) fn new(world: &'w mut GraphWorld, node: NodePos) -> Self {
        Self { world, node }
    }

    /// The node being asked.
    pub fn node(&self) -> &NodePos {
        &self.node
    }

    pub fn pos(&self) -> BlockPos {
        self.node.pos
    }

    pub fn universe(&self) -> &Universe {
        self.world.universe()
    }

    /// Nodes currently stored at `pos`.
    pub fn nodes_at(&mut self, pos: BlockPos) -> Vec<NodePos> {
        self.world.nodes_at(pos)
    }

    pub fn node_exists(&mut self, node: &NodePos) -> bool {
        self.world.graph_id_at(node).is_some()
    }

    pub fn graph_id(&mut self) -> Option<GraphId> {
        let node = self.node.clone();
        self.world.graph_id_at(&node)
    }

    /// Links of the asking node as currently stored.
    pub fn connections(&mut self) -> Vec<LinkPos> {
        let node = self.node.clone();
        self.world.connections(&node)
    }
}
