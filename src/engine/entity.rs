//! Attachments carried by graphs, nodes and links.
//!
//! Every graph carries one entity per registered [`GraphEntityType`]. An
//! entity follows its graph through merges and splits and is persisted with
//! it under its type tag.
//!
//! Nodes and links may carry one entity each, created by
//! [`BlockNode::create_node_entity`](crate::model::BlockNode::create_node_entity)
//! and [`LinkKey::create_link_entity`](crate::model::LinkKey::create_link_entity).
//! These move with their node or link into whichever graph holds it, and
//! are decoded through the [`NodeEntityType`] or [`LinkEntityType`]
//! registered under their tag.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::BlockGraph;
use crate::Result;
use crate::model::{LinkPos, NodePos, TypeTag};

/// Upcasting helper for [`GraphEntity`] trait objects.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

pub trait GraphEntity: AsAny + fmt::Debug + Send {
    fn type_tag(&self) -> TypeTag;

    fn encode(&self) -> Result<Value>;

    /// Absorb the entity of a graph being merged into this one. `other`
    /// always has the same type tag.
    fn merge(&mut self, other: Box<dyn GraphEntity>);

    /// The entity for a component split off `original` into `split`.
    fn split_new(&self, original: &BlockGraph, split: &BlockGraph) -> Box<dyn GraphEntity>;

    fn on_tick(&mut self, _graph: &BlockGraph) {}

    fn on_node_created(&mut self, _node: &NodePos) {}

    fn on_node_destroyed(&mut self, _node: &NodePos) {}

    fn on_link(&mut self, _link: &LinkPos) {}

    fn on_unlink(&mut self, _link: &LinkPos) {}
}

/// State attached to a single node.
pub trait NodeEntity: AsAny + fmt::Debug + Send {
    fn type_tag(&self) -> TypeTag;

    fn encode(&self) -> Result<Value>;

    /// The node was just created by discovery or by hand.
    fn on_added(&mut self, _node: &NodePos) {}

    /// The node came back from storage.
    fn on_loaded(&mut self, _node: &NodePos) {}

    /// The node's graph is leaving memory. The entity has been saved.
    fn on_unload(&mut self) {}

    /// The node was removed for good.
    fn on_delete(&mut self) {}
}

/// State attached to a single link.
pub trait LinkEntity: AsAny + fmt::Debug + Send {
    fn type_tag(&self) -> TypeTag;

    fn encode(&self) -> Result<Value>;

    fn on_added(&mut self, _link: &LinkPos) {}

    fn on_loaded(&mut self, _link: &LinkPos) {}

    fn on_unload(&mut self) {}

    fn on_delete(&mut self) {}
}

/// Recover the concrete entity from a boxed trait object.
pub fn downcast_entity<E: GraphEntity>(entity: Box<dyn GraphEntity>) -> Option<Box<E>> {
    <dyn GraphEntity as AsAny>::into_any(entity).downcast::<E>().ok()
}

pub type EntityFactory = Arc<dyn Fn() -> Box<dyn GraphEntity> + Send + Sync>;
pub type EntityDecoder = Arc<dyn Fn(&Value) -> Result<Box<dyn GraphEntity>> + Send + Sync>;

/// Registration record for one kind of graph entity.
#[derive(Clone)]
pub struct GraphEntityType {
    tag: TypeTag,
    factory: EntityFactory,
    decoder: EntityDecoder,
}

impl GraphEntityType {
    pub fn new(tag: TypeTag, factory: EntityFactory, decoder: EntityDecoder) -> Self {
        Self { tag, factory, decoder }
    }

    /// An entity type created with `Default` and persisted through serde.
    pub fn serde<E>(tag: TypeTag) -> Self
    where
        E: GraphEntity + Default + Serialize + DeserializeOwned,
    {
        let factory: EntityFactory = Arc::new(|| Box::new(E::default()) as Box<dyn GraphEntity>);
        let decoder: EntityDecoder = Arc::new(|data: &Value| {
            let entity = serde_json::from_value::<E>(data.clone())?;
            Ok(Box::new(entity) as Box<dyn GraphEntity>)
        });
        Self::new(tag, factory, decoder)
    }

    pub fn tag(&self) -> &TypeTag {
        &self.tag
    }

    pub fn create(&self) -> Box<dyn GraphEntity> {
        (self.factory)()
    }

    pub fn decode(&self, data: &Value) -> Result<Box<dyn GraphEntity>> {
        (self.decoder)(data)
    }
}

impl fmt::Debug for GraphEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphEntityType").field("tag", &self.tag).finish()
    }
}

/// Decodes persisted node or link entities of one tag.
pub struct EntityType<T: ?Sized> {
    tag: TypeTag,
    decoder: Arc<dyn Fn(&Value) -> Result<Box<T>> + Send + Sync>,
}

pub type NodeEntityType = EntityType<dyn NodeEntity>;
pub type LinkEntityType = EntityType<dyn LinkEntity>;

impl<T: ?Sized> EntityType<T> {
    pub fn new<F>(tag: TypeTag, decoder: F) -> Self
    where
        F: Fn(&Value) -> Result<Box<T>> + Send + Sync + 'static,
    {
        Self { tag, decoder: Arc::new(decoder) }
    }

    pub fn tag(&self) -> &TypeTag {
        &self.tag
    }

    pub fn decode(&self, data: &Value) -> Result<Box<T>> {
        (self.decoder)(data)
    }
}

impl NodeEntityType {
    pub fn serde<E>(tag: TypeTag) -> Self
    where
        E: NodeEntity + DeserializeOwned,
    {
        Self::new(tag, |data: &Value| {
            let entity = serde_json::from_value::<E>(data.clone())?;
            Ok(Box::new(entity) as Box<dyn NodeEntity>)
        })
    }
}

impl LinkEntityType {
    pub fn serde<E>(tag: TypeTag) -> Self
    where
        E: LinkEntity + DeserializeOwned,
    {
        Self::new(tag, |data: &Value| {
            let entity = serde_json::from_value::<E>(data.clone())?;
            Ok(Box::new(entity) as Box<dyn LinkEntity>)
        })
    }
}

impl<T: ?Sized> Clone for EntityType<T> {
    fn clone(&self) -> Self {
        Self { tag: self.tag.clone(), decoder: self.decoder.clone() }
    }
}

impl<T: ?Sized> fmt::Debug for EntityType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType").field("tag", &self.tag).finish()
    }
}
