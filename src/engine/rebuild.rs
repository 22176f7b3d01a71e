//! Incremental rebuild of the section index.
//!
//! A rebuild runs in two phases spread over ticks:
//!
//! 1. the index of the requested sections is cleared and every existing
//!    graph re-registers its nodes there, `max_graphs_rebuilt_per_tick`
//!    graphs per tick;
//! 2. every block of those sections is re-discovered and its links
//!    recomputed, one section per tick.

use std::collections::{BTreeSet, VecDeque};

use super::GraphWorld;
use super::events::RebuildListener;
use crate::Result;
use crate::model::{GraphId, NodePos, SectionPos};
use crate::storage::RegionSection;

/// Blocks per section.
const SECTION_VOLUME: u16 = 16 * 16 * 16;

pub(crate) struct RebuildState {
    sections: BTreeSet<SectionPos>,
    graphs: VecDeque<GraphId>,
    discover: VecDeque<SectionPos>,
    total_graphs: usize,
    total_sections: usize,
    ticks: u64,
    listener: Box<dyn RebuildListener>,
}

impl RebuildState {
    fn progress(&self) -> f32 {
        let total = self.total_graphs + self.total_sections;
        if total == 0 {
            return 1.0;
        }
        let done = total - self.graphs.len() - self.discover.len();
        done as f32 / total as f32
    }

    fn is_done(&self) -> bool {
        self.graphs.is_empty() && self.discover.is_empty()
    }
}

impl GraphWorld {
    /// Start rebuilding `sections`. If a rebuild is already running the
    /// request is rejected through
    /// [`RebuildListener::on_already_running`].
    pub fn rebuild_chunks(
        &mut self,
        sections: impl IntoIterator<Item = SectionPos>,
        mut listener: Box<dyn RebuildListener>,
    ) -> Result<()> {
        self.ensure_open()?;
        if let Some(running) = &self.rebuild {
            listener.on_already_running(running.progress(), running.total_graphs, running.total_sections);
            return Ok(());
        }

        let sections: BTreeSet<SectionPos> = sections.into_iter().collect();
        for pos in &sections {
            if let Some(mut chunk) = self.chunks.get_if_exists(*pos) {
                if !chunk.is_empty() {
                    chunk.clear();
                }
            }
        }

        let graphs: VecDeque<GraphId> = self.existing_graph_ids().into_iter().collect();
        listener.on_begin(graphs.len(), sections.len());
        tracing::info!(universe = %self.universe.id(), graphs = graphs.len(), sections = sections.len(), "rebuilding section index");

        self.rebuild = Some(RebuildState {
            discover: sections.iter().copied().collect(),
            total_graphs: graphs.len(),
            total_sections: sections.len(),
            sections,
            graphs,
            ticks: 0,
            listener,
        });
        Ok(())
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuild.is_some()
    }

    pub(super) fn continue_rebuild(&mut self) {
        let Some(mut state) = self.rebuild.take() else { return };

        for _ in 0..self.config.max_graphs_rebuilt_per_tick {
            let Some(id) = state.graphs.pop_front() else { break };
            let nodes: Vec<NodePos> = match self.graph(id) {
                Some(graph) => graph
                    .nodes()
                    .filter(|node| state.sections.contains(&node.pos.section()))
                    .cloned()
                    .collect(),
                None => continue,
            };
            for node in &nodes {
                self.index_put(node, id);
            }
        }

        if state.graphs.is_empty() {
            if let Some(section) = state.discover.pop_front() {
                self.rediscover_section(section);
            }
        }

        state.ticks += 1;
        if state.is_done() {
            state.listener.on_complete(state.total_graphs, state.total_sections);
            tracing::info!(universe = %self.universe.id(), ticks = state.ticks, "section index rebuilt");
            return;
        }
        if state.ticks % self.config.rebuild_progress_interval.max(1) == 0 {
            state.listener.on_progress(state.progress(), state.total_graphs, state.total_sections);
        }
        self.rebuild = Some(state);
    }

    fn rediscover_section(&mut self, section: SectionPos) {
        for local in 0..SECTION_VOLUME {
            let pos = section.block_at(local);
            self.update_nodes_inner(pos);
            for node in self.live_nodes_at(pos) {
                self.refresh_connections(&node);
            }
        }
        self.flush_changes();
    }
}
