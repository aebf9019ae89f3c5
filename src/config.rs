//! Pipeline-wide tunables. CLI flags (see [`crate::cli`]) override these
//! defaults; the defaults themselves are the ones named in the spec.

use serde::{Deserialize, Serialize};

/// Governs worker concurrency, memory/disk gates, and conversion/sort
/// batching for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bounded worker-pool size `W`.
    pub workers: usize,
    /// Total memory budget `M_total`, in MiB, shared across in-flight
    /// convert/sort tasks.
    pub memory_budget_mb: u64,
    /// Disk free-space floor, in GiB, below which scratch-consuming stages
    /// refuse to dispatch.
    pub min_free_space_gb: u64,
    /// Row batch size for conversion and for each in-memory sort run.
    pub batch_rows: usize,
    /// Fraction of malformed lines (0.0-1.0) a shard's conversion tolerates
    /// before failing.
    pub malformed_threshold: f64,
    /// Per-query fan-out concurrency `Q` against collection indexes.
    pub query_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus_fallback(),
            memory_budget_mb: 2048,
            min_free_space_gb: 50,
            batch_rows: 64 * 1024,
            malformed_threshold: 0.01,
            query_concurrency: 16,
        }
    }
}

impl PipelineConfig {
    /// Per-task memory budget, assuming up to `workers` stage tasks may
    /// run concurrently against the shared `memory_budget_mb` pool.
    pub fn per_task_budget_mb(&self) -> u64 {
        (self.memory_budget_mb / self.workers.max(1) as u64).max(1)
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
