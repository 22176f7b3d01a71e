//! # Universes and Type Registry
//!
//! A [`Universe`] is one independent family of connectivity graphs: its
//! node, link-key and entity types, the discoverers that say which nodes
//! should exist, listeners, and its save policy.
//!
//! Universes are assembled with [`UniverseBuilder`] at startup and sealed
//! into an `Arc<Universe>`; nothing can be registered afterwards. The set of
//! universes is likewise sealed into a [`UniverseRegistry`].
//!
//! Decoding consults the registry by [`TypeTag`]. An unknown tag or a
//! payload the decoder rejects yields `None` plus a warning, so data written
//! by a newer or removed extension only drops that one entity.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::engine::{
    GraphEntityType, LinkEntity, LinkEntityType, NodeEntity, NodeEntityType, WorldListener,
};
use crate::model::{
    BlockNode, BlockPos, EmptyLinkKey, LinkKey, LinkKeyValue, ManualLinkKey, NodeValue, TypeTag,
};
use crate::storage::SaveMode;
use crate::{Error, Result};

pub type NodeDecoder = Arc<dyn Fn(&Value) -> Result<NodeValue> + Send + Sync>;
pub type LinkKeyDecoder = Arc<dyn Fn(&Value) -> Result<LinkKeyValue> + Send + Sync>;

/// Answers which node values should exist at a block position.
pub trait NodeDiscoverer: Send + Sync {
    fn discover(&self, pos: BlockPos) -> Vec<NodeValue>;
}

// ============================================================================
// Universe
// ============================================================================

pub struct Universe {
    id: String,
    node_types: HashMap<TypeTag, NodeDecoder>,
    link_key_types: HashMap<TypeTag, LinkKeyDecoder>,
    entity_types: Vec<GraphEntityType>,
    node_entity_types: HashMap<TypeTag, NodeEntityType>,
    link_entity_types: HashMap<TypeTag, LinkEntityType>,
    discoverers: Vec<Arc<dyn NodeDiscoverer>>,
    listeners: Vec<Arc<dyn WorldListener>>,
    save_mode: SaveMode,
}

impl Universe {
    pub fn builder(id: impl Into<String>) -> UniverseBuilder {
        UniverseBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    pub fn entity_types(&self) -> &[GraphEntityType] {
        &self.entity_types
    }

    pub fn entity_type(&self, tag: &TypeTag) -> Option<&GraphEntityType> {
        self.entity_types.iter().find(|t| t.tag() == tag)
    }

    pub fn listeners(&self) -> &[Arc<dyn WorldListener>] {
        &self.listeners
    }

    pub fn decode_node(&self, tag: &TypeTag, data: &Value) -> Option<NodeValue> {
        let Some(decoder) = self.node_types.get(tag) else {
            tracing::warn!(universe = %self.id, tag = %tag, "unknown node type, dropping node");
            return None;
        };
        decoder(data)
            .inspect_err(|e| {
                tracing::warn!(universe = %self.id, tag = %tag, error = %e, "undecodable node, dropping node");
            })
            .ok()
    }

    pub fn decode_link_key(&self, tag: &TypeTag, data: &Value) -> Option<LinkKeyValue> {
        let Some(decoder) = self.link_key_types.get(tag) else {
            tracing::warn!(universe = %self.id, tag = %tag, "unknown link key type, dropping link");
            return None;
        };
        decoder(data)
            .inspect_err(|e| {
                tracing::warn!(universe = %self.id, tag = %tag, error = %e, "undecodable link key, dropping link");
            })
            .ok()
    }

    pub fn decode_node_entity(&self, tag: &TypeTag, data: &Value) -> Option<Box<dyn NodeEntity>> {
        let Some(entity_type) = self.node_entity_types.get(tag) else {
            tracing::warn!(universe = %self.id, tag = %tag, "unknown node entity type, dropping entity");
            return None;
        };
        entity_type
            .decode(data)
            .inspect_err(|e| {
                tracing::warn!(universe = %self.id, tag = %tag, error = %e, "undecodable node entity, dropping entity");
            })
            .ok()
    }

    pub fn decode_link_entity(&self, tag: &TypeTag, data: &Value) -> Option<Box<dyn LinkEntity>> {
        let Some(entity_type) = self.link_entity_types.get(tag) else {
            tracing::warn!(universe = %self.id, tag = %tag, "unknown link entity type, dropping entity");
            return None;
        };
        entity_type
            .decode(data)
            .inspect_err(|e| {
                tracing::warn!(universe = %self.id, tag = %tag, error = %e, "undecodable link entity, dropping entity");
            })
            .ok()
    }

    /// Union of every discoverer's answer. Content-equal duplicates are
    /// reported once.
    pub fn discover(&self, pos: BlockPos) -> Vec<NodeValue> {
        let mut found: Vec<NodeValue> = Vec::new();
        for discoverer in &self.discoverers {
            for value in discoverer.discover(pos) {
                if found.contains(&value) {
                    tracing::warn!(universe = %self.id, pos = %pos, node = ?value, "duplicate node discovered, ignoring");
                } else {
                    found.push(value);
                }
            }
        }
        found
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut node_types: Vec<&str> = self.node_types.keys().map(TypeTag::as_str).collect();
        node_types.sort_unstable();
        f.debug_struct("Universe")
            .field("id", &self.id)
            .field("node_types", &node_types)
            .field("entity_types", &self.entity_types.len())
            .field("node_entity_types", &self.node_entity_types.len())
            .field("link_entity_types", &self.link_entity_types.len())
            .field("discoverers", &self.discoverers.len())
            .field("save_mode", &self.save_mode)
            .finish()
    }
}

// ============================================================================
// UniverseBuilder
// ============================================================================

pub struct UniverseBuilder {
    universe: Universe,
    duplicates: Vec<String>,
}

impl UniverseBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let builder = Self {
            universe: Universe {
                id: id.into(),
                node_types: HashMap::new(),
                link_key_types: HashMap::new(),
                entity_types: Vec::new(),
                node_entity_types: HashMap::new(),
                link_entity_types: HashMap::new(),
                discoverers: Vec::new(),
                listeners: Vec::new(),
                save_mode: SaveMode::default(),
            },
            duplicates: Vec::new(),
        };
        builder
            .link_key_type(EmptyLinkKey::TYPE_TAG, |_| Ok(LinkKeyValue::empty()))
            .link_key_type(ManualLinkKey::TYPE_TAG, |_| Ok(LinkKeyValue::manual()))
    }

    pub fn node_type<F>(mut self, tag: TypeTag, decoder: F) -> Self
    where
        F: Fn(&Value) -> Result<NodeValue> + Send + Sync + 'static,
    {
        if self.universe.node_types.contains_key(&tag) {
            self.duplicates.push(format!("node type {tag}"));
        } else {
            self.universe.node_types.insert(tag, Arc::new(decoder));
        }
        self
    }

    /// Register a node type whose payload is its serde representation.
    pub fn node_type_serde<N>(self, tag: TypeTag) -> Self
    where
        N: BlockNode + DeserializeOwned,
    {
        self.node_type(tag, |data| Ok(NodeValue::new(serde_json::from_value::<N>(data.clone())?)))
    }

    pub fn link_key_type<F>(mut self, tag: TypeTag, decoder: F) -> Self
    where
        F: Fn(&Value) -> Result<LinkKeyValue> + Send + Sync + 'static,
    {
        if self.universe.link_key_types.contains_key(&tag) {
            self.duplicates.push(format!("link key type {tag}"));
        } else {
            self.universe.link_key_types.insert(tag, Arc::new(decoder));
        }
        self
    }

    pub fn link_key_type_serde<K>(self, tag: TypeTag) -> Self
    where
        K: LinkKey + DeserializeOwned,
    {
        self.link_key_type(tag, |data| Ok(LinkKeyValue::new(serde_json::from_value::<K>(data.clone())?)))
    }

    pub fn graph_entity_type(mut self, entity_type: GraphEntityType) -> Self {
        if self.universe.entity_type(entity_type.tag()).is_some() {
            self.duplicates.push(format!("graph entity type {}", entity_type.tag()));
        } else {
            self.universe.entity_types.push(entity_type);
        }
        self
    }

    pub fn node_entity_type(mut self, entity_type: NodeEntityType) -> Self {
        let tag = entity_type.tag().clone();
        if self.universe.node_entity_types.contains_key(&tag) {
            self.duplicates.push(format!("node entity type {tag}"));
        } else {
            self.universe.node_entity_types.insert(tag, entity_type);
        }
        self
    }

    pub fn link_entity_type(mut self, entity_type: LinkEntityType) -> Self {
        let tag = entity_type.tag().clone();
        if self.universe.link_entity_types.contains_key(&tag) {
            self.duplicates.push(format!("link entity type {tag}"));
        } else {
            self.universe.link_entity_types.insert(tag, entity_type);
        }
        self
    }

    pub fn discoverer(mut self, discoverer: Arc<dyn NodeDiscoverer>) -> Self {
        self.universe.discoverers.push(discoverer);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn WorldListener>) -> Self {
        self.universe.listeners.push(listener);
        self
    }

    pub fn save_mode(mut self, save_mode: SaveMode) -> Self {
        self.universe.save_mode = save_mode;
        self
    }

    /// Seal the universe. Fails if any type tag was registered twice.
    pub fn build(self) -> Result<Arc<Universe>> {
        if let Some(duplicate) = self.duplicates.into_iter().next() {
            return Err(Error::DuplicateType(format!("{duplicate} in universe {}", self.universe.id)));
        }
        Ok(Arc::new(self.universe))
    }
}

// ============================================================================
// UniverseRegistry
// ============================================================================

/// The sealed set of universes a world is opened with.
#[derive(Debug, Default)]
pub struct UniverseRegistry {
    universes: BTreeMap<String, Arc<Universe>>,
}

impl UniverseRegistry {
    pub fn builder() -> UniverseRegistryBuilder {
        UniverseRegistryBuilder::default()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Universe>> {
        self.universes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Universe>> + '_ {
        self.universes.values()
    }

    pub fn len(&self) -> usize {
        self.universes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.universes.is_empty()
    }
}

#[derive(Default)]
pub struct UniverseRegistryBuilder {
    universes: BTreeMap<String, Arc<Universe>>,
    duplicate: Option<String>,
}

impl UniverseRegistryBuilder {
    pub fn register(mut self, universe: Arc<Universe>) -> Self {
        let id = universe.id().to_string();
        if self.universes.contains_key(&id) {
            self.duplicate.get_or_insert(id);
        } else {
            self.universes.insert(id, universe);
        }
        self
    }

    pub fn build(self) -> Result<Arc<UniverseRegistry>> {
        if let Some(id) = self.duplicate {
            return Err(Error::DuplicateType(format!("universe {id}")));
        }
        Ok(Arc::new(UniverseRegistry { universes: self.universes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NodeContext;
    use crate::model::HalfLink;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    struct Lamp {
        color: u8,
    }

    impl BlockNode for Lamp {
        fn type_tag(&self) -> TypeTag {
            TypeTag::from_static("test:lamp")
        }

        fn encode(&self) -> Value {
            serde_json::json!({ "color": self.color })
        }

        fn find_connections(&self, _ctx: &mut NodeContext<'_>) -> Vec<HalfLink> {
            Vec::new()
        }

        fn can_connect(&self, _ctx: &mut NodeContext<'_>, _link: &HalfLink) -> bool {
            false
        }
    }

    const GLOW: TypeTag = TypeTag::from_static("test:glow");

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Glow {
        level: u8,
    }

    impl NodeEntity for Glow {
        fn type_tag(&self) -> TypeTag {
            GLOW
        }

        fn encode(&self) -> Result<Value> {
            Ok(serde_json::to_value(self)?)
        }
    }

    struct Fixed(Vec<u8>);

    impl NodeDiscoverer for Fixed {
        fn discover(&self, _pos: BlockPos) -> Vec<NodeValue> {
            self.0.iter().map(|color| NodeValue::new(Lamp { color: *color })).collect()
        }
    }

    fn universe() -> Arc<Universe> {
        Universe::builder("lamps")
            .node_type_serde::<Lamp>(TypeTag::from_static("test:lamp"))
            .discoverer(Arc::new(Fixed(vec![1, 2])))
            .discoverer(Arc::new(Fixed(vec![2, 3])))
            .build()
            .unwrap()
    }

    #[test]
    fn test_decode_known_and_unknown_tags() {
        let universe = universe();
        let lamp = universe
            .decode_node(&TypeTag::from_static("test:lamp"), &serde_json::json!({"color": 4}))
            .unwrap();
        assert_eq!(lamp, NodeValue::new(Lamp { color: 4 }));

        assert!(universe.decode_node(&TypeTag::from_static("test:gone"), &Value::Null).is_none());
        assert!(universe
            .decode_node(&TypeTag::from_static("test:lamp"), &serde_json::json!("bad"))
            .is_none());
    }

    #[test]
    fn test_builtin_link_keys_registered() {
        let universe = universe();
        let manual = universe.decode_link_key(&ManualLinkKey::TYPE_TAG, &Value::Null).unwrap();
        assert!(!manual.is_automatic_removal());
        assert_eq!(
            universe.decode_link_key(&EmptyLinkKey::TYPE_TAG, &Value::Null),
            Some(LinkKeyValue::empty())
        );
    }

    #[test]
    fn test_discover_dedups_across_discoverers() {
        let found = universe().discover(BlockPos::new(0, 0, 0));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let result = Universe::builder("dup")
            .node_type_serde::<Lamp>(TypeTag::from_static("test:lamp"))
            .node_type_serde::<Lamp>(TypeTag::from_static("test:lamp"))
            .build();
        assert!(matches!(result, Err(Error::DuplicateType(_))));

        let result = UniverseRegistry::builder()
            .register(universe())
            .register(universe())
            .build();
        assert!(matches!(result, Err(Error::DuplicateType(_))));

        let result = Universe::builder("dup")
            .node_entity_type(NodeEntityType::serde::<Glow>(GLOW))
            .node_entity_type(NodeEntityType::serde::<Glow>(GLOW))
            .build();
        assert!(matches!(result, Err(Error::DuplicateType(_))));
    }

    #[test]
    fn test_node_entity_decoding() {
        let universe = Universe::builder("glowing")
            .node_entity_type(NodeEntityType::serde::<Glow>(GLOW))
            .build()
            .unwrap();
        let entity = universe.decode_node_entity(&GLOW, &serde_json::json!({"level": 7})).unwrap();
        assert_eq!(entity.as_any().downcast_ref::<Glow>(), Some(&Glow { level: 7 }));

        assert!(universe.decode_node_entity(&TypeTag::from_static("test:gone"), &Value::Null).is_none());
        assert!(universe.decode_node_entity(&GLOW, &serde_json::json!([1])).is_none());
        assert!(universe.decode_link_entity(&GLOW, &Value::Null).is_none());
    }
}
