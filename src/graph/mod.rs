//! # Generic Graph
//!
//! Key-indexed node/link store used as the algorithmic substrate for
//! connectivity graphs. Nodes live in an insertion-ordered arena addressed
//! through a key index, so there are no owning back-references between
//! nodes, links and the graph.
//!
//! ```text
//! index: K ──▶ slot ──▶ Node { key, value, links: [Link(a, b, key), ..] }
//! ```
//!
//! A link is stored once in each endpoint's adjacency list. Links are
//! undirected: `Link(a, b, k) == Link(b, a, k)` and both hash identically.
//!
//! Removal never splits. Callers batch their removals and then call
//! [`Graph::split`] once.

use std::hash::{DefaultHasher, Hash, Hasher};

use hashbrown::HashMap;
use smallvec::SmallVec;

// ============================================================================
// Link
// ============================================================================

/// An undirected link between two node keys, disambiguated by `key`.
#[derive(Debug, Clone)]
pub struct Link<K, L> {
    first: K,
    second: K,
    key: L,
}

impl<K, L> Link<K, L> {
    pub fn new(first: K, second: K, key: L) -> Self {
        Self { first, second, key }
    }

    pub fn first(&self) -> &K {
        &self.first
    }

    pub fn second(&self) -> &K {
        &self.second
    }

    pub fn key(&self) -> &L {
        &self.key
    }
}

impl<K: PartialEq, L> Link<K, L> {
    /// The endpoint opposite `node`, or `None` if `node` is not an endpoint.
    pub fn other(&self, node: &K) -> Option<&K> {
        if &self.first == node {
            Some(&self.second)
        } else if &self.second == node {
            Some(&self.first)
        } else {
            None
        }
    }

    pub fn contains(&self, node: &K) -> bool {
        &self.first == node || &self.second == node
    }
}

impl<K: PartialEq, L: PartialEq> PartialEq for Link<K, L> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && ((self.first == other.first && self.second == other.second)
                || (self.first == other.second && self.second == other.first))
    }
}

impl<K: Eq, L: Eq> Eq for Link<K, L> {}

impl<K: Hash, L: Hash> Hash for Link<K, L> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a = hash_of(&self.first);
        let b = hash_of(&self.second);
        state.write_u64(a.min(b));
        state.write_u64(a.max(b));
        self.key.hash(state);
    }
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Node
// ============================================================================

/// A node with its adjacency list. Equality covers key and value only.
#[derive(Debug, Clone)]
pub struct Node<K, V, L> {
    key: K,
    value: V,
    links: SmallVec<[Link<K, L>; 4]>,
}

impl<K, V, L> Node<K, V, L> {
    fn new(key: K, value: V) -> Self {
        Self { key, value, links: SmallVec::new() }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }

    /// Links touching this node, in the order they were created.
    pub fn links(&self) -> &[Link<K, L>] {
        &self.links
    }

    pub fn degree(&self) -> usize {
        self.links.len()
    }
}

impl<K: PartialEq, V, L> Node<K, V, L> {
    pub fn neighbors(&self) -> impl Iterator<Item = &K> + '_ {
        self.links.iter().filter_map(|link| link.other(&self.key))
    }
}

impl<K: PartialEq, V: PartialEq, L> PartialEq for Node<K, V, L> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

impl<K: Eq, V: Eq, L> Eq for Node<K, V, L> {}

impl<K: Hash, V: Hash, L> Hash for Node<K, V, L> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.value.hash(state);
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Arena slots are compacted once holes outnumber live nodes past this size.
const COMPACT_THRESHOLD: usize = 32;

/// An id-less set of nodes and links.
#[derive(Debug, Clone)]
pub struct Graph<K, V, L> {
    slots: Vec<Option<Node<K, V, L>>>,
    index: HashMap<K, usize>,
    len: usize,
}

impl<K, V, L> Default for Graph<K, V, L> {
    fn default() -> Self {
        Self { slots: Vec::new(), index: HashMap::new(), len: 0 }
    }
}

impl<K, V, L> Graph<K, V, L>
where
    K: Hash + Eq + Clone,
    L: PartialEq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&Node<K, V, L>> {
        let idx = *self.index.get(key)?;
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut Node<K, V, L>> {
        let idx = *self.index.get(key)?;
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<K, V, L>> + '_ {
        self.slots.iter().flatten()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.nodes().map(Node::key)
    }

    /// Every link exactly once, reported from its `first` endpoint.
    pub fn links(&self) -> impl Iterator<Item = &Link<K, L>> + '_ {
        self.nodes()
            .flat_map(|node| node.links.iter().filter(move |link| link.first == node.key))
    }

    /// Insert a node. Returns `false` and leaves the graph untouched when the
    /// key is already present. No links are created implicitly.
    pub fn add(&mut self, key: K, value: V) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        self.push_node(Node::new(key, value));
        true
    }

    /// Remove a node and every link touching it. Does not split.
    pub fn remove(&mut self, key: &K) -> Option<Node<K, V, L>> {
        let idx = self.index.remove(key)?;
        let node = self.slots.get_mut(idx)?.take()?;
        self.len -= 1;

        for link in &node.links {
            if let Some(other) = link.other(&node.key) {
                if let Some(neighbor) = self.get_mut(other) {
                    neighbor.links.retain(|l| l != link);
                }
            }
        }

        if self.slots.len() > COMPACT_THRESHOLD && self.len * 2 < self.slots.len() {
            self.compact();
        }
        Some(node)
    }

    /// Link `a` and `b`. Returns the new link, or `None` if either node is
    /// missing, `a == b`, or an equal link already exists.
    pub fn link(&mut self, a: &K, b: &K, key: L) -> Option<Link<K, L>> {
        if a == b || !self.contains(b) {
            return None;
        }
        let link = Link::new(a.clone(), b.clone(), key);
        let first = self.get_mut(a)?;
        if first.links.contains(&link) {
            return None;
        }
        first.links.push(link.clone());
        if let Some(second) = self.get_mut(b) {
            second.links.push(link.clone());
        }
        Some(link)
    }

    /// Remove the link between `a` and `b` carrying `key`, if any.
    pub fn unlink(&mut self, a: &K, b: &K, key: &L) -> Option<Link<K, L>> {
        let first = self.get_mut(a)?;
        let pos = first
            .links
            .iter()
            .position(|l| &l.key == key && l.other(a) == Some(b))?;
        let link = first.links.remove(pos);
        if let Some(second) = self.get_mut(b) {
            second.links.retain(|l| l != &link);
        }
        Some(link)
    }

    /// Move every node and link of `other` into `self`, leaving `other` empty.
    pub fn join(&mut self, other: &mut Self) {
        let slots = std::mem::take(&mut other.slots);
        other.index.clear();
        other.len = 0;

        for node in slots.into_iter().flatten() {
            match self.get_mut(&node.key) {
                Some(existing) => {
                    for link in node.links {
                        if !existing.links.contains(&link) {
                            existing.links.push(link);
                        }
                    }
                }
                None => self.push_node(node),
            }
        }
    }

    /// Partition into connected components.
    ///
    /// The largest component stays in `self`; every other component is
    /// returned as a new graph. Components are discovered in insertion
    /// order and on equal size the earlier one is kept. Iterative, O(V+E).
    pub fn split(&mut self) -> Vec<Self> {
        if self.len <= 1 {
            return Vec::new();
        }

        let components = self.components();
        if components.len() <= 1 {
            return Vec::new();
        }

        let mut keep = 0;
        for (i, members) in components.iter().enumerate() {
            if members.len() > components[keep].len() {
                keep = i;
            }
        }

        let mut split_off = Vec::with_capacity(components.len() - 1);
        for (i, members) in components.into_iter().enumerate() {
            if i == keep {
                continue;
            }
            let mut graph = Self::new();
            for idx in members {
                if let Some(node) = self.slots.get_mut(idx).and_then(Option::take) {
                    self.index.remove(&node.key);
                    self.len -= 1;
                    graph.push_node(node);
                }
            }
            split_off.push(graph);
        }

        self.compact();
        split_off
    }

    /// Slot indices of each connected component, each sorted ascending.
    fn components(&self) -> Vec<Vec<usize>> {
        const UNSEEN: usize = usize::MAX;

        let mut component_of = vec![UNSEEN; self.slots.len()];
        let mut components = Vec::new();
        let mut stack = Vec::new();

        for start in 0..self.slots.len() {
            if self.slots[start].is_none() || component_of[start] != UNSEEN {
                continue;
            }
            let id = components.len();
            let mut members = Vec::new();
            component_of[start] = id;
            stack.push(start);

            while let Some(i) = stack.pop() {
                members.push(i);
                let Some(node) = &self.slots[i] else { continue };
                for neighbor in node.neighbors() {
                    if let Some(&j) = self.index.get(neighbor) {
                        if component_of[j] == UNSEEN {
                            component_of[j] = id;
                            stack.push(j);
                        }
                    }
                }
            }

            members.sort_unstable();
            components.push(members);
        }
        components
    }

    fn push_node(&mut self, node: Node<K, V, L>) {
        self.index.insert(node.key.clone(), self.slots.len());
        self.slots.push(Some(node));
        self.len += 1;
    }

    fn compact(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        self.index.clear();
        self.slots.reserve(self.len);
        for node in slots.into_iter().flatten() {
            self.index.insert(node.key.clone(), self.slots.len());
            self.slots.push(Some(node));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
