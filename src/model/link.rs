//! Link keys and link identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{DynValue, NodePos, TypeTag};
use crate::engine::LinkEntity;
use crate::graph::Link;

/// Disambiguates parallel links between the same two nodes.
pub trait LinkKey: DynValue + fmt::Debug + Send + Sync {
    fn type_tag(&self) -> TypeTag;

    fn encode(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Whether a connection update may drop this link once neither side
    /// reports it anymore.
    fn is_automatic_removal(&self) -> bool {
        true
    }

    fn create_link_entity(&self, _link: &LinkPos) -> Option<Box<dyn LinkEntity>> {
        None
    }
}

/// A shared, content-compared [`LinkKey`].
#[derive(Clone)]
pub struct LinkKeyValue(Arc<dyn LinkKey>);

impl LinkKeyValue {
    pub fn new<K: LinkKey>(key: K) -> Self {
        Self(Arc::new(key))
    }

    pub fn empty() -> Self {
        Self::new(EmptyLinkKey)
    }

    pub fn manual() -> Self {
        Self::new(ManualLinkKey)
    }

    pub fn get(&self) -> &dyn LinkKey {
        &*self.0
    }

    pub fn type_tag(&self) -> TypeTag {
        self.0.type_tag()
    }

    pub fn is_automatic_removal(&self) -> bool {
        self.0.is_automatic_removal()
    }

    pub fn downcast_ref<K: LinkKey>(&self) -> Option<&K> {
        self.get().as_any().downcast_ref::<K>()
    }
}

impl PartialEq for LinkKeyValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.type_tag() == other.type_tag() && self.get().dyn_eq(other.get().as_any()))
    }
}

impl Eq for LinkKeyValue {}

impl Hash for LinkKeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_tag().hash(state);
        self.get().dyn_hash(state);
    }
}

impl fmt::Debug for LinkKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl Default for LinkKeyValue {
    fn default() -> Self {
        Self::empty()
    }
}

/// The plain key for the single link between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EmptyLinkKey;

impl EmptyLinkKey {
    pub const TYPE_TAG: TypeTag = TypeTag::from_static("blockgraph:empty");
}

impl LinkKey for EmptyLinkKey {
    fn type_tag(&self) -> TypeTag {
        Self::TYPE_TAG
    }
}

/// Key for links made by hand. Discovery never removes these while both
/// endpoints exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ManualLinkKey;

impl ManualLinkKey {
    pub const TYPE_TAG: TypeTag = TypeTag::from_static("blockgraph:manual");
}

impl LinkKey for ManualLinkKey {
    fn type_tag(&self) -> TypeTag {
        Self::TYPE_TAG
    }

    fn is_automatic_removal(&self) -> bool {
        false
    }
}

/// A link's identity: both endpoint nodes and the key. Undirected.
pub type LinkPos = Link<NodePos, LinkKeyValue>;

/// One side's view of a link: the node on the other end and the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HalfLink {
    pub key: LinkKeyValue,
    pub other: NodePos,
}

impl HalfLink {
    pub fn new(key: LinkKeyValue, other: NodePos) -> Self {
        Self { key, other }
    }

    /// The same link seen from `other`, pointing back at `from`.
    pub fn reverse(&self, from: &NodePos) -> HalfLink {
        HalfLink::new(self.key.clone(), from.clone())
    }

    pub fn to_link_pos(&self, from: &NodePos) -> LinkPos {
        LinkPos::new(from.clone(), self.other.clone(), self.key.clone())
    }
}
