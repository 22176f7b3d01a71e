//! Observer hooks.

use crate::model::{GraphId, NodePos};

/// Universe-wide notifications, registered through
/// [`crate::registry::UniverseBuilder::listener`].
pub trait WorldListener: Send + Sync {
    fn on_graph_created(&self, _universe: &str, _graph: GraphId) {}

    fn on_graph_destroyed(&self, _universe: &str, _graph: GraphId) {}

    /// The graph's node or link set changed.
    fn on_graph_updated(&self, _universe: &str, _graph: GraphId) {}

    /// The graph is about to leave memory.
    fn on_graph_unloading(&self, _universe: &str, _graph: GraphId) {}

    fn on_connections_changed(&self, _universe: &str, _node: &NodePos) {}
}

/// Progress reports for [`super::GraphWorld::rebuild_chunks`].
pub trait RebuildListener: Send {
    fn on_begin(&mut self, _graphs: usize, _sections: usize) {}

    /// `progress` is in `0.0..=1.0`.
    fn on_progress(&mut self, _progress: f32, _graphs: usize, _sections: usize) {}

    fn on_complete(&mut self, _graphs: usize, _sections: usize) {}

    /// A rebuild was requested while another is still running. The request
    /// is dropped.
    fn on_already_running(&mut self, _progress: f32, _graphs: usize, _sections: usize) {}
}

/// A listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentRebuild;

impl RebuildListener for SilentRebuild {}

/// Forwards rebuild progress to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingRebuild {
    universe: String,
}

impl LoggingRebuild {
    pub fn new(universe: impl Into<String>) -> Self {
        Self { universe: universe.into() }
    }
}

impl RebuildListener for LoggingRebuild {
    fn on_begin(&mut self, graphs: usize, sections: usize) {
        tracing::info!(universe = %self.universe, graphs, sections, "rebuild started");
    }

    fn on_progress(&mut self, progress: f32, graphs: usize, sections: usize) {
        tracing::info!(universe = %self.universe, progress = %format!("{:.1}%", progress * 100.0), graphs, sections, "rebuilding");
    }

    fn on_complete(&mut self, graphs: usize, sections: usize) {
        tracing::info!(universe = %self.universe, graphs, sections, "rebuild complete");
    }

    fn on_already_running(&mut self, progress: f32, _graphs: usize, _sections: usize) {
        tracing::warn!(universe = %self.universe, progress = %format!("{:.1}%", progress * 100.0), "rebuild already running");
    }
}
