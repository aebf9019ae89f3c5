//! The per-collection pointer index artifact: `host -> ordered host runs`.
//! Backed by a sorted `Vec` keyed on `host_reversed` (binary-search
//! equality lookup, and a contiguous range for prefix queries), bulk-loaded
//! from the indexer's externally-sorted scan and sealed read-only.
//!
//! This mirrors the shape of hand-rolled index structures seen across the
//! wider storage-engine corpus (a small serializable struct with a sorted
//! key vector plus a parallel value vector) rather than reaching for a
//! general-purpose embedded KV store the pack does not otherwise depend on.

use crate::error::{CdxError, Result};
use crate::model::HostRun;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One host's entry: its canonical (non-reversed) name plus its runs,
/// already in ascending `(shard_id, row_offset)` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HostEntry {
    host_reversed: String,
    host: String,
    runs: Vec<HostRun>,
}

/// Sealed, read-only per-collection pointer index. Entries are sorted by
/// `host_reversed`, which makes both exact-host lookup (binary search) and
/// `*.example.com`-style suffix queries (a contiguous range starting at the
/// binary-search insertion point of the prefix) `O(log N)` to locate.
#[derive(Debug, Serialize, Deserialize)]
pub struct CollectionIndex {
    collection: String,
    entries: Vec<HostEntry>,
    shard_row_counts: Vec<(u32, u64)>,
}

/// One emitted `(host, run)` pair from a collection scan, before entries
/// are grouped and sorted for sealing.
pub struct RawRunTuple {
    pub host: String,
    pub host_reversed: String,
    pub run: HostRun,
}

pub struct CollectionIndexBuilder {
    collection: String,
    by_host: std::collections::HashMap<String, (String, Vec<HostRun>)>,
    shard_row_counts: Vec<(u32, u64)>,
}

impl CollectionIndexBuilder {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            by_host: std::collections::HashMap::new(),
            shard_row_counts: Vec::new(),
        }
    }

    pub fn record_shard_row_count(&mut self, shard_id: u32, row_count: u64) {
        self.shard_row_counts.push((shard_id, row_count));
    }

    pub fn push(&mut self, tuple: RawRunTuple) {
        self.by_host
            .entry(tuple.host_reversed.clone())
            .or_insert_with(|| (tuple.host.clone(), Vec::new()))
            .1
            .push(tuple.run);
    }

    /// Seals the builder into a [`CollectionIndex`], sorting entries by
    /// `host_reversed` and each host's runs by `(shard_id, row_offset)`.
    pub fn build(self) -> CollectionIndex {
        let mut entries: Vec<HostEntry> = self
            .by_host
            .into_iter()
            .map(|(host_reversed, (host, mut runs))| {
                runs.sort();
                HostEntry {
                    host_reversed,
                    host,
                    runs,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.host_reversed.cmp(&b.host_reversed));

        CollectionIndex {
            collection: self.collection,
            entries,
            shard_row_counts: self.shard_row_counts,
        }
    }
}

impl CollectionIndex {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn host_count(&self) -> usize {
        self.entries.len()
    }

    pub fn shard_count(&self) -> usize {
        self.shard_row_counts.len()
    }

    /// Sum of `row_count` across all runs — used by the indexer's
    /// post-build validation against the sum of shard row counts (run
    /// coverage invariant, spec section 8).
    pub fn total_run_rows(&self) -> u64 {
        self.entries
            .iter()
            .flat_map(|e| e.runs.iter())
            .map(|r| r.row_count)
            .sum()
    }

    pub fn total_shard_rows(&self) -> u64 {
        self.shard_row_counts.iter().map(|(_, n)| n).sum()
    }

    /// Exact-host lookup. `O(log N)` via binary search on `host_reversed`.
    pub fn lookup(&self, host: &str) -> Option<&[HostRun]> {
        let key = crate::model::reverse_host(host);
        self.entries
            .binary_search_by(|e| e.host_reversed.as_str().cmp(key.as_str()))
            .ok()
            .map(|idx| self.entries[idx].runs.as_slice())
    }

    /// Suffix/prefix lookup: every host ending in `suffix` (e.g. all hosts
    /// under `example.com`, matched as `host_reversed` starting with
    /// `com.example`). Returns `(host, runs)` pairs in `host_reversed` order.
    pub fn lookup_prefix(&self, suffix: &str) -> Vec<(&str, &[HostRun])> {
        let key = crate::model::reverse_host(suffix);
        let start = self
            .entries
            .partition_point(|e| e.host_reversed.as_str() < key.as_str());
        self.entries[start..]
            .iter()
            .take_while(|e| {
                e.host_reversed.as_str() == key.as_str()
                    || e.host_reversed.starts_with(&format!("{key}."))
            })
            .map(|e| (e.host.as_str(), e.runs.as_slice()))
            .collect()
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("index")
        ));
        std::fs::write(&tmp, &bytes).map_err(|e| CdxError::OutputUnwritable {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, path).map_err(|e| CdxError::OutputUnwritable {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| CdxError::InputUnreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        bincode::deserialize(&bytes).map_err(|e| CdxError::ArtifactCorrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
