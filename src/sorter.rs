//! C3: rewrites an unsorted columnar shard as a sorted shard, totally
//! ordered by `(host_reversed, url, timestamp)`, via a memory-bounded
//! external merge sort (spec section 4.3).

use crate::columnar::{ColumnarReader, ColumnarWriter};
use crate::error::{CdxError, Result};
use crate::model::CaptureRow;
use crate::shard_store::{ShardState, ShardStore};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

/// A `Cancel` is polled between merge levels and between run-formation
/// batches, per the cooperative-cancellation discipline in spec section 5.
pub trait Cancel {
    fn is_cancelled(&self) -> bool;
}

impl Cancel for () {
    fn is_cancelled(&self) -> bool {
        false
    }
}

pub struct SortReport {
    pub row_count: u64,
    pub run_count: usize,
    pub was_noop: bool,
}

/// Sorts `(collection, shard_id)`'s unsorted columnar shard in place,
/// producing the canonical sorted shard. `batch_rows` bounds the size of
/// each in-memory run; `cancel` is polled between runs and between merge
/// passes.
///
/// Idempotent: if a sorted shard already exists (any row count — a
/// previous, possibly partial run is never left under the canonical name,
/// so its mere presence means a prior attempt fully completed), this is a
/// no-op.
pub fn sort_shard(
    store: &ShardStore,
    collection: &str,
    shard_id: u32,
    batch_rows: usize,
    cancel: &impl Cancel,
) -> Result<SortReport> {
    if store.has_sorted(collection, shard_id) {
        let existing = store.open_sorted(collection, shard_id)?;
        return Ok(SortReport {
            row_count: existing.row_count(),
            run_count: 0,
            was_noop: true,
        });
    }

    let unsorted_path = store.unsorted_shard_path(collection, shard_id);
    let reader = ColumnarReader::open(&unsorted_path)?;

    if already_sorted(&reader)? {
        let rows = reader.read_all()?;
        let row_count = rows.len() as u64;
        let canonical = store.write_columnar(collection, shard_id, &rows, ShardState::Sorted)?;
        return Ok(SortReport {
            row_count,
            run_count: if row_count == 0 { 0 } else { 1 },
            was_noop: false,
        });
    }

    let dir = store.collection_dir(collection);
    std::fs::create_dir_all(&dir)?;
    let mut run_paths = Vec::new();
    let run_prefix = format!(".{shard_id}.run.{}", std::process::id());

    let result = (|| -> Result<u64> {
        let total_rows = reader.row_count();
        let mut offset = 0u64;
        let mut run_idx = 0usize;
        while offset < total_rows {
            if cancel.is_cancelled() {
                return Err(CdxError::Cancelled);
            }
            let take = batch_rows.min((total_rows - offset) as usize) as u64;
            let mut batch = reader.read_rows(offset, take)?;
            batch.sort_by(|a, b| compare_rows(a, b));
            let run_path = dir.join(format!("{run_prefix}.{run_idx}"));
            write_run(&run_path, &batch)?;
            run_paths.push(run_path);
            offset += take;
            run_idx += 1;
        }

        if cancel.is_cancelled() {
            return Err(CdxError::Cancelled);
        }

        let tmp_sorted = dir.join(format!(".{shard_id}.sorted.{}.tmp", std::process::id()));
        let merged = k_way_merge(&run_paths, &tmp_sorted, cancel)?;
        store.mark_sorted(collection, shard_id, &tmp_sorted)?;
        Ok(merged)
    })();

    for run_path in &run_paths {
        let _ = std::fs::remove_file(run_path);
    }

    match result {
        Ok(row_count) => Ok(SortReport {
            row_count,
            run_count: run_paths.len(),
            was_noop: false,
        }),
        Err(e) => {
            // No partial artifact is ever left under the canonical sorted
            // name: k_way_merge only writes a temp path, and mark_sorted's
            // rename is the only way that temp path becomes canonical.
            Err(e)
        }
    }
}

fn compare_rows(a: &CaptureRow, b: &CaptureRow) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

/// Cheap precheck: scans the unsorted shard and reports whether it is
/// already in sorted order, letting the sorter skip run formation entirely.
fn already_sorted(reader: &ColumnarReader) -> Result<bool> {
    let rows = reader.read_all()?;
    Ok(rows.windows(2).all(|w| compare_rows(&w[0], &w[1]) != Ordering::Greater))
}

fn write_run(path: &Path, rows: &[CaptureRow]) -> Result<()> {
    let mut w = ColumnarWriter::create(path)?;
    for row in rows {
        w.write_row(row)?;
    }
    w.finish()?;
    Ok(())
}

/// One entry in the k-way merge heap: the next undelivered row of one run.
struct HeapEntry {
    row: CaptureRow,
    run_id: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.row.sort_key() == other.row.sort_key() && self.run_id == other.run_id
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops
        // first, with ties broken by run id (stable: earlier run wins).
        other
            .row
            .sort_key()
            .cmp(&self.row.sort_key())
            .then_with(|| other.run_id.cmp(&self.run_id))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A per-run read cursor that only ever holds [`RUN_PREFETCH_ROWS`] rows of
/// that run in memory at once, refilling from disk as the merge drains it.
/// This is what keeps the merge's resident memory at `fan_in *
/// prefetch_size` rather than the sum of all run sizes.
const RUN_PREFETCH_ROWS: u64 = 1024;

struct RunCursor {
    reader: ColumnarReader,
    buffer: std::collections::VecDeque<CaptureRow>,
    next_fetch: u64,
    total_rows: u64,
}

impl RunCursor {
    fn open(path: &Path) -> Result<Self> {
        let reader = ColumnarReader::open(path)?;
        let total_rows = reader.row_count();
        let mut cursor = Self {
            reader,
            buffer: std::collections::VecDeque::new(),
            next_fetch: 0,
            total_rows,
        };
        cursor.refill()?;
        Ok(cursor)
    }

    fn refill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() || self.next_fetch >= self.total_rows {
            return Ok(());
        }
        let take = RUN_PREFETCH_ROWS.min(self.total_rows - self.next_fetch);
        let rows = self.reader.read_rows(self.next_fetch, take)?;
        self.next_fetch += take;
        self.buffer.extend(rows);
        Ok(())
    }

    fn peek(&self) -> Option<&CaptureRow> {
        self.buffer.front()
    }

    fn pop(&mut self) -> Result<Option<CaptureRow>> {
        let row = self.buffer.pop_front();
        self.refill()?;
        Ok(row)
    }
}

/// Merges sorted run files into one sorted columnar shard at `out_path`,
/// polling `cancel` between merge levels (here: every [`RUN_PREFETCH_ROWS`]
/// rows written).
fn k_way_merge(run_paths: &[PathBuf], out_path: &Path, cancel: &impl Cancel) -> Result<u64> {
    let mut cursors: Vec<RunCursor> = run_paths
        .iter()
        .map(|p| RunCursor::open(p))
        .collect::<Result<_>>()?;

    let mut heap = BinaryHeap::new();
    for (run_id, cursor) in cursors.iter().enumerate() {
        if let Some(row) = cursor.peek() {
            heap.push(HeapEntry {
                row: row.clone(),
                run_id,
            });
        }
    }

    let mut writer = ColumnarWriter::create(out_path)?;
    let mut merged = 0u64;
    let mut since_cancel_check = 0u32;
    while let Some(entry) = heap.pop() {
        writer.write_row(&entry.row)?;
        merged += 1;
        cursors[entry.run_id].pop()?;
        if let Some(next_row) = cursors[entry.run_id].peek() {
            heap.push(HeapEntry {
                row: next_row.clone(),
                run_id: entry.run_id,
            });
        }

        since_cancel_check += 1;
        if since_cancel_check >= RUN_PREFETCH_ROWS as u32 {
            since_cancel_check = 0;
            if cancel.is_cancelled() {
                drop(writer);
                let _ = std::fs::remove_file(out_path);
                return Err(CdxError::Cancelled);
            }
        }
    }
    writer.finish()?;
    Ok(merged)
}
