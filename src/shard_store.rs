//! C1: directory-structured storage for raw/unsorted/sorted columnar shards,
//! per spec section 4.1 and the filesystem layout in section 6.
//!
//! Canonical naming (the open question in spec section 9, resolved here):
//! sortedness is encoded by extension, not a sibling marker file —
//! `<shard_id>.columnar` for unsorted, `<shard_id>.columnar.sorted` for
//! sorted. This makes [`ShardStore::list_shards`] a single directory scan.

use crate::columnar::{ColumnarReader, ColumnarWriter};
use crate::error::{CdxError, Result};
use crate::model::CaptureRow;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Raw,
    Unsorted,
    Sorted,
}

#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub shard_id: u32,
    pub state: ShardState,
    pub path: PathBuf,
    pub row_count: Option<u64>,
}

pub struct ShardStore {
    root: PathBuf,
}

impl ShardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    fn raw_path(&self, collection: &str, shard_id: u32) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{shard_id}.raw.gz"))
    }

    fn unsorted_path(&self, collection: &str, shard_id: u32) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{shard_id}.columnar"))
    }

    fn sorted_path(&self, collection: &str, shard_id: u32) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{shard_id}.columnar.sorted"))
    }

    pub fn raw_shard_path(&self, collection: &str, shard_id: u32) -> PathBuf {
        self.raw_path(collection, shard_id)
    }

    pub fn unsorted_shard_path(&self, collection: &str, shard_id: u32) -> PathBuf {
        self.unsorted_path(collection, shard_id)
    }

    pub fn sorted_shard_path(&self, collection: &str, shard_id: u32) -> PathBuf {
        self.sorted_path(collection, shard_id)
    }

    /// Lists every shard known for `collection`, preferring the most
    /// advanced state present (sorted over unsorted over raw) for each
    /// `shard_id`.
    pub fn list_shards(&self, collection: &str) -> Result<Vec<ShardInfo>> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        use std::collections::BTreeMap;
        let mut by_id: BTreeMap<u32, ShardInfo> = BTreeMap::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let (shard_id, state) = if let Some(id) = name.strip_suffix(".columnar.sorted") {
                (id, ShardState::Sorted)
            } else if let Some(id) = name.strip_suffix(".columnar") {
                (id, ShardState::Unsorted)
            } else if let Some(id) = name.strip_suffix(".raw.gz") {
                (id, ShardState::Raw)
            } else {
                continue;
            };
            let Ok(shard_id) = shard_id.parse::<u32>() else {
                continue;
            };

            let rank = |s: ShardState| match s {
                ShardState::Sorted => 2,
                ShardState::Unsorted => 1,
                ShardState::Raw => 0,
            };
            let better = by_id
                .get(&shard_id)
                .map(|existing| rank(state) > rank(existing.state))
                .unwrap_or(true);
            if better {
                let row_count = match state {
                    ShardState::Raw => None,
                    _ => ColumnarReader::open(&path).ok().map(|r| r.row_count()),
                };
                by_id.insert(
                    shard_id,
                    ShardInfo {
                        shard_id,
                        state,
                        path,
                        row_count,
                    },
                );
            }
        }
        Ok(by_id.into_values().collect())
    }

    pub fn has_sorted(&self, collection: &str, shard_id: u32) -> bool {
        self.sorted_path(collection, shard_id).is_file()
    }

    pub fn has_unsorted_or_sorted(&self, collection: &str, shard_id: u32) -> bool {
        self.unsorted_path(collection, shard_id).is_file() || self.has_sorted(collection, shard_id)
    }

    pub fn open_sorted(&self, collection: &str, shard_id: u32) -> Result<ColumnarReader> {
        ColumnarReader::open(&self.sorted_path(collection, shard_id))
    }

    pub fn open_unsorted(&self, collection: &str, shard_id: u32) -> Result<ColumnarReader> {
        ColumnarReader::open(&self.unsorted_path(collection, shard_id))
    }

    /// Writes `rows` as a new columnar shard in the given `state`
    /// (`Unsorted` or `Sorted`), atomically: write under a temporary name
    /// in the same directory, `fsync`-flush, then rename into the
    /// canonical name. Never leaves a partial file under the canonical name.
    pub fn write_columnar(
        &self,
        collection: &str,
        shard_id: u32,
        rows: &[CaptureRow],
        state: ShardState,
    ) -> Result<PathBuf> {
        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir)?;
        let canonical = match state {
            ShardState::Sorted => self.sorted_path(collection, shard_id),
            ShardState::Unsorted => self.unsorted_path(collection, shard_id),
            ShardState::Raw => {
                return Err(CdxError::OutputUnwritable {
                    path: dir,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "cannot write a raw shard through write_columnar",
                    ),
                })
            }
        };
        let tmp = dir.join(format!(".{shard_id}.{}.tmp", std::process::id()));

        let write_result = (|| -> Result<()> {
            let mut writer = ColumnarWriter::create(&tmp)?;
            for row in rows {
                writer.write_row(row)?;
            }
            writer.finish()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        fs::rename(&tmp, &canonical).map_err(|e| CdxError::OutputUnwritable {
            path: canonical.clone(),
            source: e,
        })?;
        Ok(canonical)
    }

    /// Atomically promotes a temporary sorted-output file (already fully
    /// written by [`crate::sorter`]) to the canonical sorted name for
    /// `(collection, shard_id)`.
    pub fn mark_sorted(&self, collection: &str, shard_id: u32, tmp_sorted: &Path) -> Result<PathBuf> {
        let canonical = self.sorted_path(collection, shard_id);
        fs::rename(tmp_sorted, &canonical).map_err(|e| CdxError::OutputUnwritable {
            path: canonical.clone(),
            source: e,
        })?;
        Ok(canonical)
    }

    pub fn delete_temp_files(&self, collection: &str) -> Result<()> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.') && n.ends_with(".tmp"))
                .unwrap_or(false)
            {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{host_of, reverse_host};

    fn row(n: u64) -> CaptureRow {
        let url = format!("https://example.com/{n}");
        let host = host_of(&url).unwrap();
        CaptureRow {
            host_reversed: reverse_host(&host),
            host,
            url,
            timestamp: "20240101000000".into(),
            warc_filename: "w.warc.gz".into(),
            warc_offset: n,
            warc_length: 10,
        }
    }

    #[test]
    fn write_then_list_reports_sorted_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        store
            .write_columnar("CC-MAIN-2024-30", 0, &[row(0), row(1)], ShardState::Sorted)
            .unwrap();

        let shards = store.list_shards("CC-MAIN-2024-30").unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].state, ShardState::Sorted);
        assert_eq!(shards[0].row_count, Some(2));
    }

    #[test]
    fn sorted_preferred_over_unsorted_for_same_shard_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        store
            .write_columnar("CC-MAIN-2024-30", 0, &[row(0)], ShardState::Unsorted)
            .unwrap();
        store
            .write_columnar("CC-MAIN-2024-30", 0, &[row(0), row(1)], ShardState::Sorted)
            .unwrap();

        let shards = store.list_shards("CC-MAIN-2024-30").unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].state, ShardState::Sorted);
    }

    #[test]
    fn failed_write_leaves_no_canonical_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        // write_columnar with Raw should error and never produce a file.
        let err = store.write_columnar("CC-MAIN-2024-30", 0, &[], ShardState::Raw);
        assert!(err.is_err());
        assert!(!store.sorted_shard_path("CC-MAIN-2024-30", 0).exists());
        assert!(!store.unsorted_shard_path("CC-MAIN-2024-30", 0).exists());
    }

    #[test]
    fn empty_collection_dir_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        assert!(store.list_shards("CC-MAIN-2024-30").unwrap().is_empty());
    }
}
