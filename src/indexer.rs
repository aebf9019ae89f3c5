//! C4: builds the per-collection pointer index by scanning a collection's
//! sorted shards for host-run boundaries (spec section 4.4).

use crate::collection_index::{CollectionIndex, CollectionIndexBuilder, RawRunTuple};
use crate::error::{CdxError, Result};
use crate::model::HostRun;
use crate::shard_store::{ShardState, ShardStore};

/// Scans one sorted shard and emits a `(host, run)` tuple per maximal
/// contiguous run of same-`host` rows, in row order. A linear scan of rows
/// already sorted by `host_reversed` is sufficient to find every boundary:
/// a run ends either when `host` changes or the shard ends.
pub fn scan_shard_runs(store: &ShardStore, collection: &str, shard_id: u32) -> Result<Vec<RawRunTuple>> {
    let reader = store.open_sorted(collection, shard_id)?;
    let rows = reader.read_all()?;

    let mut tuples = Vec::new();
    let mut run_start = 0u64;
    let mut current_host: Option<(&str, &str)> = None;

    for (i, row) in rows.iter().enumerate() {
        let i = i as u64;
        match current_host {
            None => {
                current_host = Some((&row.host, &row.host_reversed));
            }
            Some((host, _)) if host != row.host => {
                let (prev_host, prev_host_reversed) = current_host.unwrap();
                tuples.push(RawRunTuple {
                    host: prev_host.to_string(),
                    host_reversed: prev_host_reversed.to_string(),
                    run: HostRun::new(shard_id, run_start, i - run_start),
                });
                run_start = i;
                current_host = Some((&row.host, &row.host_reversed));
            }
            _ => {}
        }
    }
    if let Some((host, host_reversed)) = current_host {
        tuples.push(RawRunTuple {
            host: host.to_string(),
            host_reversed: host_reversed.to_string(),
            run: HostRun::new(shard_id, run_start, rows.len() as u64 - run_start),
        });
    }

    Ok(tuples)
}

/// Builds the complete collection index by scanning every sorted shard of
/// `collection`, per spec section 4.4's build algorithm.
///
/// Fails with [`CdxError::ArtifactCorrupted`] if any shard is missing its
/// sorted form, or if the post-build run-coverage invariant (`Σ row_count`
/// over runs equals the sum of shard row counts) does not hold.
pub fn build_collection_index(store: &ShardStore, collection: &str) -> Result<CollectionIndex> {
    let shards = store.list_shards(collection)?;
    let mut builder = CollectionIndexBuilder::new(collection);

    for shard in &shards {
        if shard.state != ShardState::Sorted {
            return Err(CdxError::ArtifactCorrupted {
                path: shard.path.clone(),
                reason: format!(
                    "shard {} is not sorted; index build requires all shards sorted first",
                    shard.shard_id
                ),
            });
        }
        let row_count = shard.row_count.unwrap_or(0);
        builder.record_shard_row_count(shard.shard_id, row_count);

        for tuple in scan_shard_runs(store, collection, shard.shard_id)? {
            builder.push(tuple);
        }
    }

    let index = builder.build();
    if index.total_run_rows() != index.total_shard_rows() {
        return Err(CdxError::ArtifactCorrupted {
            path: store.collection_dir(collection),
            reason: format!(
                "run coverage invariant violated: runs cover {} rows, shards contain {}",
                index.total_run_rows(),
                index.total_shard_rows()
            ),
        });
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{host_of, reverse_host, CaptureRow};

    fn row(host: &str, n: u64) -> CaptureRow {
        let url = format!("https://{host}/{n}");
        CaptureRow {
            host_reversed: reverse_host(host),
            host: host_of(&url).unwrap(),
            url,
            timestamp: "20240101000000".into(),
            warc_filename: "w.warc.gz".into(),
            warc_offset: n,
            warc_length: 1,
        }
    }

    #[test]
    fn single_row_shard_emits_one_run_of_count_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        store
            .write_columnar("CC-MAIN-2024-30", 0, &[row("example.com", 0)], ShardState::Sorted)
            .unwrap();

        let tuples = scan_shard_runs(&store, "CC-MAIN-2024-30", 0).unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].run.row_count, 1);
    }

    #[test]
    fn host_spanning_whole_shard_emits_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let rows: Vec<_> = (0..5).map(|n| row("example.com", n)).collect();
        store
            .write_columnar("CC-MAIN-2024-30", 0, &rows, ShardState::Sorted)
            .unwrap();

        let tuples = scan_shard_runs(&store, "CC-MAIN-2024-30", 0).unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].run.row_count, 5);
    }

    #[test]
    fn two_shard_scenario_emits_two_runs_for_same_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let mut shard0: Vec<_> = (0..5).map(|n| row("example.com", n)).collect();
        shard0.push(row("other.org", 5));
        let shard1 = vec![
            row("example.com", 0),
            row("example.com", 1),
            row("example.com", 2),
            row("zzz.net", 3),
        ];
        store
            .write_columnar("CC-MAIN-2024-30", 0, &shard0, ShardState::Sorted)
            .unwrap();
        store
            .write_columnar("CC-MAIN-2024-30", 1, &shard1, ShardState::Sorted)
            .unwrap();

        let index = build_collection_index(&store, "CC-MAIN-2024-30").unwrap();
        let runs = index.lookup("example.com").unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].shard_id, 0);
        assert_eq!(runs[0].row_count, 5);
        assert_eq!(runs[1].shard_id, 1);
        assert_eq!(runs[1].row_count, 3);
        assert_eq!(index.total_run_rows(), 9);
    }

    #[test]
    fn empty_collection_builds_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        std::fs::create_dir_all(store.collection_dir("CC-MAIN-2024-30")).unwrap();
        let index = build_collection_index(&store, "CC-MAIN-2024-30").unwrap();
        assert_eq!(index.host_count(), 0);
    }

    #[test]
    fn unsorted_shard_present_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        store
            .write_columnar("CC-MAIN-2024-30", 0, &[row("example.com", 0)], ShardState::Unsorted)
            .unwrap();
        let result = build_collection_index(&store, "CC-MAIN-2024-30");
        assert!(result.is_err());
    }
}
