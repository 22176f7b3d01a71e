//! Node values and their content-equality identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{BlockPos, DynValue, HalfLink, TypeTag};
use crate::engine::{NodeContext, NodeEntity};
use crate::wire::WireShape;

/// Behaviour of a node type.
///
/// Values are immutable. Two values that compare equal (same concrete type,
/// `Eq`) at the same position are the same node across successive
/// discovery passes.
pub trait BlockNode: DynValue + fmt::Debug + Send + Sync {
    fn type_tag(&self) -> TypeTag;

    /// Payload persisted next to the type tag.
    fn encode(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Candidate links from this node, usually to nodes found through
    /// [`NodeContext::nodes_at`] in a bounded neighbourhood.
    fn find_connections(&self, ctx: &mut NodeContext<'_>) -> Vec<HalfLink>;

    /// Whether this node accepts `link`. Must agree with what
    /// `find_connections` reports.
    fn can_connect(&self, ctx: &mut NodeContext<'_>, link: &HalfLink) -> bool;

    /// Called once per batch when this node's set of links changed.
    fn on_connections_changed(&self, _ctx: &mut NodeContext<'_>) {}

    /// Whether discovery may remove this node once it is no longer reported.
    fn is_automatic_removal(&self) -> bool {
        true
    }

    /// Entity for a node that has none yet, either just created or loaded
    /// without a decodable one.
    fn create_node_entity(&self, _node: &NodePos) -> Option<Box<dyn NodeEntity>> {
        None
    }

    /// How this node takes part in the [`crate::wire`] connection rules.
    fn wire_shape(&self) -> Option<WireShape> {
        None
    }
}

/// A shared, content-compared [`BlockNode`].
#[derive(Clone)]
pub struct NodeValue(Arc<dyn BlockNode>);

impl NodeValue {
    pub fn new<N: BlockNode>(node: N) -> Self {
        Self(Arc::new(node))
    }

    pub fn get(&self) -> &dyn BlockNode {
        &*self.0
    }

    pub fn type_tag(&self) -> TypeTag {
        self.0.type_tag()
    }

    pub fn downcast_ref<N: BlockNode>(&self) -> Option<&N> {
        self.get().as_any().downcast_ref::<N>()
    }
}

impl PartialEq for NodeValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.type_tag() == other.type_tag() && self.get().dyn_eq(other.get().as_any()))
    }
}

impl Eq for NodeValue {}

impl Hash for NodeValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_tag().hash(state);
        self.get().dyn_hash(state);
    }
}

impl fmt::Debug for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// A node's identity: where it is and what it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePos {
    pub pos: BlockPos,
    pub node: NodeValue,
}

impl NodePos {
    pub fn new(pos: BlockPos, node: NodeValue) -> Self {
        Self { pos, node }
    }
}

impl fmt::Display for NodePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node.type_tag(), self.pos)
    }
}
