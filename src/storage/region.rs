//! # Region Store
//!
//! Keeps per-column pillars of section data resident on demand.
//!
//! ```text
//! column ──▶ Pillar { sections: y ──▶ S, dirty, last_used }
//!               │
//!               └── blob: {"sections": {"<y>": <S::encode>}}   (None when empty)
//! ```
//!
//! Residency is driven by an [`UnloadTimer`] over columns. Columns the host
//! world has loaded are pinned; every other column expires after
//! `max_age_ticks` without use and is saved (if dirty) and evicted on the
//! next [`RegionStore::tick`].
//!
//! Missing data is fetched with a blocking read, since callers need a
//! definite answer. Loading a world column also issues a prefetch whose
//! completion is applied on the owning thread during the next access or
//! tick, unless the pillar became resident some other way first.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::mpsc;

use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use super::worker::Prefetched;
use super::{BlobKey, SaveMode, StorageConfig, StorageWorker};
use crate::Result;
use crate::model::{ColumnPos, SectionPos};
use crate::timer::UnloadTimer;

// ============================================================================
// Section contract
// ============================================================================

/// Data kept per section.
pub trait RegionSection: Sized {
    /// Shared decoding context, such as a type registry.
    type Context: Send + Sync;

    fn empty(pos: SectionPos) -> Self;

    /// Empty sections are not persisted.
    fn is_empty(&self) -> bool;

    fn encode(&self) -> Result<serde_json::Value>;

    fn decode(pos: SectionPos, data: serde_json::Value, context: &Self::Context) -> Result<Self>;
}

/// Mutable access to a section. Marks the owning pillar dirty on first
/// mutable dereference.
pub struct SectionMut<'a, S> {
    section: &'a mut S,
    dirty: &'a mut bool,
}

impl<S> Deref for SectionMut<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.section
    }
}

impl<S> DerefMut for SectionMut<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        *self.dirty = true;
        self.section
    }
}

// ============================================================================
// Pillar
// ============================================================================

/// The resident sections of one column.
#[derive(Debug)]
pub struct Pillar<S> {
    sections: BTreeMap<i32, S>,
    dirty: bool,
    last_used: u64,
}

impl<S> Default for Pillar<S> {
    fn default() -> Self {
        Self { sections: BTreeMap::new(), dirty: false, last_used: 0 }
    }
}

impl<S> Pillar<S> {
    pub fn sections(&self) -> impl Iterator<Item = (i32, &S)> + '_ {
        self.sections.iter().map(|(y, section)| (*y, section))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_used(&self) -> u64 {
        self.last_used
    }
}

#[derive(Serialize, Deserialize)]
struct PillarRecord {
    sections: BTreeMap<i32, serde_json::Value>,
}

/// What one [`RegionStore::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionTick {
    /// Idle pillars dropped from memory (saved first when dirty).
    pub evicted: usize,
    /// Dirty pillars written back by the save policy.
    pub flushed: usize,
}

// ============================================================================
// RegionStore
// ============================================================================

pub struct RegionStore<S: RegionSection> {
    worker: Arc<StorageWorker>,
    context: Arc<S::Context>,
    timer: UnloadTimer<ColumnPos>,
    pillars: BTreeMap<ColumnPos, Pillar<S>>,
    save_mode: SaveMode,
    incremental_factor: usize,
    save_cursor: Option<ColumnPos>,
    in_flight: HashMap<ColumnPos, u64>,
    next_token: u64,
    prefetch_tx: mpsc::Sender<Prefetched>,
    prefetch_rx: mpsc::Receiver<Prefetched>,
}

impl<S: RegionSection> RegionStore<S> {
    pub fn new(
        worker: Arc<StorageWorker>,
        context: Arc<S::Context>,
        config: &StorageConfig,
        save_mode: SaveMode,
    ) -> Self {
        let (prefetch_tx, prefetch_rx) = mpsc::channel();
        Self {
            worker,
            context,
            timer: UnloadTimer::new(config.max_age_ticks),
            pillars: BTreeMap::new(),
            save_mode,
            incremental_factor: config.incremental_save_factor.max(1),
            save_cursor: None,
            in_flight: HashMap::new(),
            next_token: 0,
            prefetch_tx,
            prefetch_rx,
        }
    }

    pub fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    pub fn timer(&self) -> &UnloadTimer<ColumnPos> {
        &self.timer
    }

    pub fn is_resident(&self, column: ColumnPos) -> bool {
        self.pillars.contains_key(&column)
    }

    pub fn resident_columns(&self) -> impl Iterator<Item = ColumnPos> + '_ {
        self.pillars.keys().copied()
    }

    pub fn pillar(&self, column: ColumnPos) -> Option<&Pillar<S>> {
        self.pillars.get(&column)
    }

    pub fn dirty_count(&self) -> usize {
        self.pillars.values().filter(|p| p.dirty).count()
    }

    /// A resident section, without touching storage or the timer.
    pub fn peek(&self, pos: SectionPos) -> Option<&S> {
        self.pillars.get(&pos.column())?.sections.get(&pos.y)
    }

    /// The section at `pos`, loading its pillar and creating an empty
    /// section when needed. Creation alone does not dirty the pillar.
    pub fn get_or_create(&mut self, pos: SectionPos) -> SectionMut<'_, S> {
        let Pillar { sections, dirty, .. } = self.touch(pos.column());
        let section = sections.entry(pos.y).or_insert_with(|| S::empty(pos));
        SectionMut { section, dirty }
    }

    /// The section at `pos` if stored, loading its pillar when needed.
    pub fn get_if_exists(&mut self, pos: SectionPos) -> Option<SectionMut<'_, S>> {
        let Pillar { sections, dirty, .. } = self.touch(pos.column());
        sections.get_mut(&pos.y).map(|section| SectionMut { section, dirty })
    }

    /// Pin a column the host has loaded and start fetching its data.
    pub fn on_world_column_load(&mut self, column: ColumnPos) {
        self.timer.on_pin(&column);
        if self.pillars.contains_key(&column) || self.in_flight.contains_key(&column) {
            return;
        }
        let token = self.next_token;
        self.next_token += 1;
        self.in_flight.insert(column, token);
        self.worker.prefetch(BlobKey::Region(column), token, self.prefetch_tx.clone());
    }

    pub fn on_world_column_unload(&mut self, column: ColumnPos) {
        self.timer.on_unpin(&column);
    }

    /// Advance time, evict idle pillars and apply the save policy.
    pub fn tick(&mut self) -> RegionTick {
        self.drain_prefetched();
        self.timer.tick();

        let mut report = RegionTick::default();
        for column in self.timer.due_for_eviction() {
            self.timer.forget(&column);
            let Some(pillar) = self.pillars.remove(&column) else { continue };
            if pillar.dirty {
                if let Err(e) = self.write_pillar(column, &pillar) {
                    tracing::error!(column = %column, error = %e, "failed to save evicted pillar");
                }
            }
            tracing::trace!(column = %column, "evicted pillar");
            report.evicted += 1;
        }

        let mut dirty: Vec<ColumnPos> = self
            .pillars
            .iter()
            .filter(|(_, pillar)| pillar.dirty)
            .map(|(column, _)| *column)
            .collect();
        let budget = match self.save_mode {
            SaveMode::Manual => 0,
            SaveMode::Incremental => dirty.len().div_ceil(self.incremental_factor),
            SaveMode::Immediate => dirty.len(),
        };
        if budget == 0 {
            return report;
        }

        // Resume after the last column saved so no dirty pillar starves.
        if let Some(cursor) = self.save_cursor {
            let start = dirty.partition_point(|column| *column <= cursor);
            dirty.rotate_left(start);
        }
        for column in dirty.into_iter().take(budget) {
            match self.save_chunk(column) {
                Ok(()) => report.flushed += 1,
                Err(e) => tracing::error!(column = %column, error = %e, "failed to save pillar"),
            }
            self.save_cursor = Some(column);
        }
        report
    }

    /// Write one resident column. Columns that are not resident are left
    /// untouched.
    pub fn save_chunk(&mut self, column: ColumnPos) -> Result<()> {
        let Some(pillar) = self.pillars.get_mut(&column) else {
            return Ok(());
        };
        let blob = encode_pillar(column, pillar)?;
        self.worker.write(BlobKey::Region(column), blob)?;
        pillar.dirty = false;
        Ok(())
    }

    /// Write every dirty resident column.
    pub fn save_all(&mut self) -> Result<()> {
        let dirty: Vec<ColumnPos> = self
            .pillars
            .iter()
            .filter(|(_, pillar)| pillar.dirty)
            .map(|(column, _)| *column)
            .collect();
        for column in dirty {
            self.save_chunk(column)?;
        }
        Ok(())
    }

    /// Save everything and wait for the writes to land.
    pub fn close(&mut self) -> Result<()> {
        self.save_all()?;
        self.worker.flush_blocking()
    }

    fn write_pillar(&self, column: ColumnPos, pillar: &Pillar<S>) -> Result<()> {
        let blob = encode_pillar(column, pillar)?;
        self.worker.write(BlobKey::Region(column), blob)
    }

    /// Make `column` resident, record the use and return its pillar.
    fn touch(&mut self, column: ColumnPos) -> &mut Pillar<S> {
        self.drain_prefetched();
        self.timer.on_use(&column);
        let now = self.timer.now();

        let pillar = match self.pillars.entry(column) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.in_flight.remove(&column);
                let pillar = match self.worker.read_blocking(BlobKey::Region(column)) {
                    Ok(blob) => decode_pillar::<S>(column, blob, &self.context),
                    Err(e) => {
                        tracing::error!(column = %column, error = %e, "pillar read failed, substituting empty pillar");
                        Pillar::default()
                    }
                };
                entry.insert(pillar)
            }
        };
        pillar.last_used = now;
        pillar
    }

    fn drain_prefetched(&mut self) {
        while let Ok((key, token, result)) = self.prefetch_rx.try_recv() {
            let BlobKey::Region(column) = key else { continue };
            if self.in_flight.get(&column) != Some(&token) {
                continue;
            }
            self.in_flight.remove(&column);
            if self.pillars.contains_key(&column) {
                continue;
            }

            let mut pillar = match result {
                Ok(blob) => decode_pillar::<S>(column, blob, &self.context),
                Err(e) => {
                    tracing::error!(column = %column, error = %e, "pillar prefetch failed, substituting empty pillar");
                    Pillar::default()
                }
            };
            pillar.last_used = self.timer.now();
            self.timer.on_use(&column);
            self.pillars.insert(column, pillar);
        }
    }
}

impl<S: RegionSection> std::fmt::Debug for RegionStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionStore")
            .field("resident", &self.pillars.len())
            .field("dirty", &self.dirty_count())
            .field("save_mode", &self.save_mode)
            .finish()
    }
}

// ============================================================================
// Pillar codec
// ============================================================================

fn encode_pillar<S: RegionSection>(column: ColumnPos, pillar: &Pillar<S>) -> Result<Option<Bytes>> {
    let mut sections = BTreeMap::new();
    for (y, section) in &pillar.sections {
        if section.is_empty() {
            continue;
        }
        match section.encode() {
            Ok(data) => {
                sections.insert(*y, data);
            }
            Err(e) => {
                tracing::error!(section = %column.section(*y), error = %e, "failed to encode section, skipping");
            }
        }
    }
    if sections.is_empty() {
        return Ok(None);
    }
    let blob = serde_json::to_vec(&PillarRecord { sections })?;
    Ok(Some(Bytes::from(blob)))
}

fn decode_pillar<S: RegionSection>(
    column: ColumnPos,
    blob: Option<Bytes>,
    context: &S::Context,
) -> Pillar<S> {
    let mut pillar = Pillar::default();
    let Some(blob) = blob else { return pillar };

    let record: PillarRecord = match serde_json::from_slice(&blob) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(column = %column, error = %e, "undecodable pillar, substituting empty pillar");
            return pillar;
        }
    };

    for (y, data) in record.sections {
        let pos = column.section(y);
        match S::decode(pos, data, context) {
            Ok(section) if !section.is_empty() => {
                pillar.sections.insert(y, section);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(section = %pos, error = %e, "dropping undecodable section"),
        }
    }
    pillar
}

// ============================================================================
// Tests
// ============================================================================
