//! Connectivity graph identifiers.

use serde::{Deserialize, Serialize};

/// Persistent id of a connectivity graph. Allocated once, never reused
/// while a graph with that id exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub u64);

impl GraphId {
    /// Fixed-width hex form used in blob names.
    pub fn to_hex(self) -> String {
        format!("{:016X}", self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(GraphId)
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
