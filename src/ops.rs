//! Operator commands over a [`GraphWorld`].

use serde::Serialize;

use crate::Result;
use crate::engine::{GraphWorld, RebuildListener};
use crate::model::{BlockPos, GraphId, SectionPos};

/// One line of a graph listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    pub id: GraphId,
    pub nodes: usize,
    pub links: usize,
    pub sections: usize,
}

/// An inclusive box of blocks, normalised so `min <= max` on every axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub min: BlockPos,
    pub max: BlockPos,
}

impl BlockRange {
    pub fn new(a: BlockPos, b: BlockPos) -> Self {
        Self {
            min: BlockPos::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: BlockPos::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn volume(&self) -> u64 {
        let span = |lo: i32, hi: i32| (i64::from(hi) - i64::from(lo) + 1) as u64;
        span(self.min.x, self.max.x) * span(self.min.y, self.max.y) * span(self.min.z, self.max.z)
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockPos> + '_ {
        (self.min.y..=self.max.y).flat_map(move |y| {
            (self.min.z..=self.max.z)
                .flat_map(move |z| (self.min.x..=self.max.x).map(move |x| BlockPos::new(x, y, z)))
        })
    }

    /// Sections overlapping the range.
    pub fn sections(&self) -> Vec<SectionPos> {
        let (lo, hi) = (self.min.section(), self.max.section());
        let mut sections = Vec::new();
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    sections.push(SectionPos::new(x, y, z));
                }
            }
        }
        sections
    }
}

/// Resident graphs, by id.
pub fn list_graphs(world: &GraphWorld) -> Vec<GraphSummary> {
    world
        .loaded_graph_ids()
        .into_iter()
        .filter_map(|id| world.loaded_graph(id))
        .map(|graph| GraphSummary {
            id: graph.id(),
            nodes: graph.len(),
            links: graph.link_count(),
            sections: graph.sections().count(),
        })
        .collect()
}

pub fn describe_graph(world: &mut GraphWorld, id: GraphId) -> Result<GraphSummary> {
    let graph = world.require_graph(id)?;
    Ok(GraphSummary {
        id,
        nodes: graph.len(),
        links: graph.link_count(),
        sections: graph.sections().count(),
    })
}

/// Rebuild every section overlapping `from..=to`. Progress is reported to
/// `listener` over the following ticks.
pub fn rebuild_chunks(
    world: &mut GraphWorld,
    from: BlockPos,
    to: BlockPos,
    listener: Box<dyn RebuildListener>,
) -> Result<()> {
    world.rebuild_chunks(BlockRange::new(from, to).sections(), listener)
}

pub fn remove_empty_graphs(world: &mut GraphWorld) -> Result<usize> {
    world.remove_empty_graphs()
}

/// Re-run discovery on every block in `from..=to` as one batch. Returns
/// the number of positions visited.
pub fn update_nodes_in(world: &mut GraphWorld, from: BlockPos, to: BlockPos) -> Result<usize> {
    let range = BlockRange::new(from, to);
    tracing::debug!(universe = %world.universe().id(), blocks = range.volume(), "bulk node update");
    world.update_nodes_batch(range.blocks())
}
