//! # Connectivity Model
//!
//! Plain data shared by every layer: world coordinates, type tags, node
//! and link-key values and the identity keys built from them.
//!
//! Design rule: no storage, no engine state. Node behaviour is expressed
//! through the [`BlockNode`] and [`LinkKey`] traits, which the engine
//! calls back into.

pub mod id;
pub mod link;
pub mod node;
pub mod pos;
pub mod value;

pub use id::GraphId;
pub use link::{EmptyLinkKey, HalfLink, LinkKey, LinkKeyValue, LinkPos, ManualLinkKey};
pub use node::{BlockNode, NodePos, NodeValue};
pub use pos::{Axis, BlockPos, ColumnPos, Direction, SECTION_SIZE, SectionPos};
pub use value::{DynValue, TypeTag};
