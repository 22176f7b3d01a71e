//! Tick-driven eviction scheduling.
//!
//! Every tracked key is either pinned (anchored by the host's own loaded
//! state, never evicted) or carries the tick at which it becomes due.

use std::hash::Hash;

use hashbrown::{HashMap, HashSet};

/// Ticks per simulated second in the host environment.
pub const TICKS_PER_SECOND: u64 = 20;

/// Default idle time before eviction: one simulated minute.
pub const DEFAULT_MAX_AGE: u64 = 60 * TICKS_PER_SECOND;

#[derive(Debug, Clone)]
pub struct UnloadTimer<K> {
    max_age: u64,
    now: u64,
    pinned: HashSet<K>,
    expiry: HashMap<K, u64>,
}

impl<K: Hash + Eq + Clone> UnloadTimer<K> {
    pub fn new(max_age: u64) -> Self {
        Self {
            max_age,
            now: 0,
            pinned: HashSet::new(),
            expiry: HashMap::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    /// Record a use. Unpinned keys expire `max_age` ticks from now.
    pub fn on_use(&mut self, key: &K) {
        if !self.pinned.contains(key) {
            self.expiry.insert(key.clone(), self.now + self.max_age);
        }
    }

    pub fn on_pin(&mut self, key: &K) {
        self.expiry.remove(key);
        self.pinned.insert(key.clone());
    }

    pub fn on_unpin(&mut self, key: &K) {
        if self.pinned.remove(key) {
            self.expiry.insert(key.clone(), self.now + self.max_age);
        }
    }

    /// Stop tracking a key once its data has been evicted.
    pub fn forget(&mut self, key: &K) {
        self.expiry.remove(key);
    }

    pub fn tick(&mut self) {
        self.now += 1;
    }

    pub fn is_pinned(&self, key: &K) -> bool {
        self.pinned.contains(key)
    }

    /// Pinned, or scheduled but not yet forgotten.
    pub fn is_tracked(&self, key: &K) -> bool {
        self.pinned.contains(key) || self.expiry.contains_key(key)
    }

    /// Unpinned keys whose expiry is at or before now, oldest first.
    pub fn due_for_eviction(&self) -> Vec<K> {
        let mut due: Vec<(&K, u64)> = self
            .expiry
            .iter()
            .filter(|(_, at)| **at <= self.now)
            .map(|(key, at)| (key, *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.into_iter().map(|(key, _)| key.clone()).collect()
    }
}

impl<K: Hash + Eq + Clone> Default for UnloadTimer<K> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}
