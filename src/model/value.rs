//! Type tags and content equality for trait-object values.

use std::any::Any;
use std::borrow::{Borrow, Cow};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Stable string id of a node, link-key or graph-entity type.
///
/// Tags are persisted next to every payload and resolved through the
/// universe's type registry on load.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(Cow<'static, str>);

impl TypeTag {
    pub const fn from_static(tag: &'static str) -> Self {
        Self(Cow::Borrowed(tag))
    }

    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TypeTag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object-safe equality and hashing, implemented for every `Eq + Hash` type.
///
/// Node values and link keys are stored as trait objects but compared by
/// content: two separately discovered values that are equal are the same
/// node.
pub trait DynValue: Any {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn Any) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T: Any + Eq + Hash> DynValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dyn_eq_requires_same_type() {
        let a: &dyn DynValue = &5u32;
        assert!(a.dyn_eq(&5u32));
        assert!(!a.dyn_eq(&6u32));
        assert!(!a.dyn_eq(&5u64));
    }

    #[test]
    fn test_type_tag_static_and_owned_equal() {
        let a = TypeTag::from_static("test:wire");
        let b = TypeTag::new(String::from("test:wire"));
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"test:wire\"");
    }
}
