//! C5: maintains the year and master meta-indexes, per spec section 4.5.
//! Meta-indexes store only references and small aggregates — never capture
//! rows — so a corrupted collection index degrades exactly the one
//! subtree under it (spec section 9, "three-tier federation").

use crate::collection_index::CollectionIndex;
use crate::error::{CdxError, Result};
use crate::model::CollectionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub collection: String,
    pub index_path: PathBuf,
    pub host_count: u64,
    pub shard_count: u64,
    pub indexed_at_unix: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearIndex {
    pub year: u16,
    pub collections: BTreeMap<String, CollectionSummary>,
}

impl YearIndex {
    pub fn total_hosts(&self) -> u64 {
        self.collections.values().map(|c| c.host_count).sum()
    }

    pub fn total_shards(&self) -> u64 {
        self.collections.values().map(|c| c.shard_count).sum()
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        atomic_write_bincode(self, path)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        atomic_read_bincode(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearSummary {
    pub year: u16,
    pub index_path: PathBuf,
    pub collection_count: u64,
    pub host_count: u64,
    pub shard_count: u64,
    pub indexed_at_unix: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterIndex {
    pub years: BTreeMap<u16, YearSummary>,
}

impl MasterIndex {
    pub fn total_collections(&self) -> u64 {
        self.years.values().map(|y| y.collection_count).sum()
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        atomic_write_bincode(self, path)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        atomic_read_bincode(path)
    }
}

/// Current wall-clock time as a unix timestamp, used to stamp
/// `indexed_at` on collection/year summaries at rebuild time.
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn atomic_write_bincode<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let bytes = bincode::serialize(value)?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("meta")
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

fn atomic_read_bincode<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| CdxError::InputUnreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    bincode::deserialize(&bytes).map_err(|e| CdxError::ArtifactCorrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Discovers every collection index under `index_root/by_collection` whose
/// identifier encodes `year`, and rebuilds that year's meta-index from
/// scratch (year rebuilds are always full rebuilds; meta-indexes are
/// small, per spec section 4.5).
pub fn build_year_index(
    index_root: &Path,
    year: u16,
    now_unix: u64,
) -> Result<YearIndex> {
    let by_collection_dir = index_root.join("by_collection");
    let mut collections = BTreeMap::new();

    if by_collection_dir.exists() {
        for entry in std::fs::read_dir(&by_collection_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".pointer_index"))
            else {
                continue;
            };
            let Ok(id) = stem.parse::<CollectionId>() else {
                continue;
            };
            if id.year != year {
                continue;
            }
            match CollectionIndex::read_from(&path) {
                Ok(idx) => {
                    collections.insert(
                        stem.to_string(),
                        CollectionSummary {
                            collection: stem.to_string(),
                            index_path: path.clone(),
                            host_count: idx.host_count() as u64,
                            shard_count: idx.shard_count() as u64,
                            indexed_at_unix: now_unix,
                        },
                    );
                }
                Err(_) => {
                    // A corrupted collection index degrades exactly this
                    // one collection's subtree; it is simply omitted from
                    // the year aggregate rather than failing the rebuild.
                    continue;
                }
            }
        }
    }

    Ok(YearIndex { year, collections })
}

/// Discovers every year index under `index_root/by_year` and rebuilds the
/// master index from scratch.
pub fn build_master_index(index_root: &Path, now_unix: u64) -> Result<MasterIndex> {
    let by_year_dir = index_root.join("by_year");
    let mut years = BTreeMap::new();

    if by_year_dir.exists() {
        for entry in std::fs::read_dir(&by_year_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".year_index"))
            else {
                continue;
            };
            let Ok(year) = stem.parse::<u16>() else {
                continue;
            };
            match YearIndex::read_from(&path) {
                Ok(yi) => {
                    years.insert(
                        year,
                        YearSummary {
                            year,
                            index_path: path.clone(),
                            collection_count: yi.collections.len() as u64,
                            host_count: yi.total_hosts(),
                            shard_count: yi.total_shards(),
                            indexed_at_unix: now_unix,
                        },
                    );
                }
                Err(_) => continue,
            }
        }
    }

    Ok(MasterIndex { years })
}

pub fn year_index_path(index_root: &Path, year: u16) -> PathBuf {
    index_root.join("by_year").join(format!("{year:04}.year_index"))
}

pub fn master_index_path(index_root: &Path) -> PathBuf {
    index_root.join("master.index")
}

pub fn collection_index_path(index_root: &Path, collection: &str) -> PathBuf {
    index_root
        .join("by_collection")
        .join(format!("{collection}.pointer_index"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection_index::{CollectionIndexBuilder, RawRunTuple};
    use crate::model::{reverse_host, HostRun};

    #[test]
    fn year_index_aggregates_only_matching_year() {
        let dir = tempfile::tempdir().unwrap();
        let index_root = dir.path();

        for (collection, host) in [
            ("CC-MAIN-2024-10", "example.com"),
            ("CC-MAIN-2024-20", "other.com"),
            ("CC-MAIN-2025-05", "third.com"),
        ] {
            let mut b = CollectionIndexBuilder::new(collection);
            b.record_shard_row_count(0, 1);
            b.push(RawRunTuple {
                host: host.to_string(),
                host_reversed: reverse_host(host),
                run: HostRun::new(0, 0, 1),
            });
            let idx = b.build();
            idx.write_to(&collection_index_path(index_root, collection))
                .unwrap();
        }

        let year_idx = build_year_index(index_root, 2024, 1_000).unwrap();
        assert_eq!(year_idx.collections.len(), 2);
        assert_eq!(year_idx.total_hosts(), 2);
        assert!(year_idx.collections.contains_key("CC-MAIN-2024-10"));
        assert!(!year_idx.collections.contains_key("CC-MAIN-2025-05"));
    }

    #[test]
    fn master_index_aggregates_year_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let index_root = dir.path();

        let yi = YearIndex {
            year: 2024,
            collections: BTreeMap::new(),
        };
        yi.write_to(&year_index_path(index_root, 2024)).unwrap();

        let master = build_master_index(index_root, 42).unwrap();
        assert_eq!(master.years.len(), 1);
        assert_eq!(master.total_collections(), 0);
    }

    #[test]
    fn corrupted_collection_index_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let index_root = dir.path();
        let path = collection_index_path(index_root, "CC-MAIN-2024-10");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a valid index").unwrap();

        let year_idx = build_year_index(index_root, 2024, 1).unwrap();
        assert!(year_idx.collections.is_empty());
    }
}
