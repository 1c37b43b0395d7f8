//! Execution results - what a run reports back
//!
//! A run always yields exactly one [`ExecutionResult`]: on success the
//! error list is empty; on failure it lists the primary cause first,
//! followed by secondary cancellations. Per-node counters accumulate in a
//! [`StatsRecorder`] owned by the run context.

use crate::error::PipelineError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-node execution counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStats {
    /// Items the node consumed from its (merged) input
    pub items_in: u64,
    /// Items the node emitted downstream
    pub items_out: u64,
    /// Retries scheduled for the node (item retries and restarts)
    pub retries: u64,
    /// Item-level failures observed at the node
    pub failures: u64,
    /// Wall time from first to last involvement in the run
    pub duration: Duration,
}

/// Outcome of one pipeline run
#[derive(Debug)]
pub struct ExecutionResult {
    /// Whether the run completed without a fatal error
    pub success: bool,
    /// Primary cause first, then secondary cancellations; empty on success
    pub errors: Vec<PipelineError>,
    /// Wall time of the whole run
    pub duration: Duration,
    /// Per-node counters keyed by node id
    pub node_stats: HashMap<String, NodeStats>,
}

impl ExecutionResult {
    /// The first (primary) error, if the run failed
    pub fn primary_error(&self) -> Option<&PipelineError> {
        self.errors.first()
    }

    /// Counters for one node
    pub fn stats_for(&self, node_id: &str) -> Option<&NodeStats> {
        self.node_stats.get(node_id)
    }
}

#[derive(Debug, Default)]
struct StatsCell {
    stats: NodeStats,
    started: Option<Instant>,
}

/// Thread-safe accumulator for per-node counters
///
/// Strategies and the runner record into this through the run context;
/// `snapshot` produces the map embedded in the final result.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    cells: Mutex<HashMap<String, StatsCell>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register a node so it shows up even with zero traffic
    pub fn register(&self, node_id: &str) {
        self.cells
            .lock()
            .expect("stats lock poisoned")
            .entry(node_id.to_string())
            .or_default();
    }

    pub fn record_in(&self, node_id: &str) {
        self.with_cell(node_id, |c| c.stats.items_in += 1);
    }

    pub fn record_out(&self, node_id: &str) {
        self.with_cell(node_id, |c| c.stats.items_out += 1);
    }

    pub fn record_retry(&self, node_id: &str) {
        self.with_cell(node_id, |c| c.stats.retries += 1);
    }

    pub fn record_failure(&self, node_id: &str) {
        self.with_cell(node_id, |c| c.stats.failures += 1);
    }

    /// Mark the node's first involvement in the run
    pub fn node_started(&self, node_id: &str) {
        self.with_cell(node_id, |c| {
            if c.started.is_none() {
                c.started = Some(Instant::now());
            }
        });
    }

    /// Mark the node's last involvement and accumulate its duration
    pub fn node_finished(&self, node_id: &str) {
        self.with_cell(node_id, |c| {
            if let Some(started) = c.started {
                c.stats.duration = started.elapsed();
            }
        });
    }

    /// Current counters for all registered nodes
    pub fn snapshot(&self) -> HashMap<String, NodeStats> {
        self.cells
            .lock()
            .expect("stats lock poisoned")
            .iter()
            .map(|(id, cell)| (id.clone(), cell.stats.clone()))
            .collect()
    }

    fn with_cell(&self, node_id: &str, f: impl FnOnce(&mut StatsCell)) {
        let mut cells = self.cells.lock().expect("stats lock poisoned");
        f(cells.entry(node_id.to_string()).or_default());
    }
}
