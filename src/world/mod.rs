//! # GraphWorldStorage
//!
//! One [`GraphWorld`] per registered universe over a shared host world.
//! Host events are forwarded to every universe. A failure or panic in one
//! universe is logged with its id and does not stop the others.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::engine::GraphWorld;
use crate::model::ColumnPos;
use crate::registry::{Universe, UniverseRegistry};
use crate::storage::{BlobStore, StorageConfig};
use crate::{Error, Result};

pub struct GraphWorldStorage {
    registry: Arc<UniverseRegistry>,
    worlds: BTreeMap<String, GraphWorld>,
}

impl GraphWorldStorage {
    /// Open every universe with stores built from `config.blob`.
    pub fn open(registry: Arc<UniverseRegistry>, config: &StorageConfig) -> Result<Self> {
        Self::open_with(registry, config, |universe| config.blob.open(universe.id()))
    }

    /// Open every universe with a caller-chosen store per universe.
    pub fn open_with<F>(registry: Arc<UniverseRegistry>, config: &StorageConfig, mut store_for: F) -> Result<Self>
    where
        F: FnMut(&Universe) -> Result<Arc<dyn BlobStore>>,
    {
        config.validate()?;
        let mut worlds = BTreeMap::new();
        for universe in registry.iter() {
            let store = store_for(universe)?;
            let world = GraphWorld::open(universe.clone(), store, config.clone())?;
            worlds.insert(universe.id().to_string(), world);
        }
        tracing::info!(universes = worlds.len(), "graph world storage opened");
        Ok(Self { registry, worlds })
    }

    pub fn registry(&self) -> &Arc<UniverseRegistry> {
        &self.registry
    }

    pub fn universe_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.worlds.keys().map(String::as_str)
    }

    pub fn world(&self, universe: &str) -> Result<&GraphWorld> {
        self.worlds
            .get(universe)
            .ok_or_else(|| Error::UnknownUniverse(universe.to_string()))
    }

    pub fn world_mut(&mut self, universe: &str) -> Result<&mut GraphWorld> {
        self.worlds
            .get_mut(universe)
            .ok_or_else(|| Error::UnknownUniverse(universe.to_string()))
    }

    pub fn on_world_column_load(&mut self, column: ColumnPos) {
        self.for_each("load column", |world| world.on_world_column_load(column));
    }

    pub fn on_world_column_unload(&mut self, column: ColumnPos) {
        self.for_each("unload column", |world| world.on_world_column_unload(column));
    }

    /// Tick every universe. Returns how many failed.
    pub fn tick(&mut self) -> usize {
        self.for_each("tick", GraphWorld::tick).len()
    }

    pub fn save_chunk(&mut self, column: ColumnPos) -> Result<()> {
        first_error(self.for_each("save chunk", |world| world.save_chunk(column)))
    }

    pub fn save_all(&mut self) -> Result<()> {
        first_error(self.for_each("save", GraphWorld::save_all))
    }

    pub fn close(&mut self) -> Result<()> {
        let result = first_error(self.for_each("close", GraphWorld::close));
        tracing::info!(universes = self.worlds.len(), "graph world storage closed");
        result
    }

    /// Run `op` on every universe, collecting failures.
    fn for_each<F>(&mut self, what: &str, mut op: F) -> Vec<Error>
    where
        F: FnMut(&mut GraphWorld) -> Result<()>,
    {
        let mut failures = Vec::new();
        for (universe, world) in &mut self.worlds {
            let outcome = catch_unwind(AssertUnwindSafe(|| op(world)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => Error::StorageError(format!("panicked: {}", panic_message(panic.as_ref()))),
            };
            tracing::error!(universe = %universe, error = %error, "failed to {what}");
            failures.push(error);
        }
        failures
    }
}

impl std::fmt::Debug for GraphWorldStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.worlds.iter()).finish()
    }
}

fn first_error(failures: Vec<Error>) -> Result<()> {
    match failures.into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
