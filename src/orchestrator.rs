//! C6: drives each collection through `downloaded -> converted -> sorted ->
//! indexed`, per spec section 4.6. Resumable (progress-record-gated),
//! idempotent (every stage delegates its own idempotence check to C2-C5),
//! concurrency-bounded (a fixed-size worker pool, at most one in-flight
//! task per `(collection, shard_id, stage)`), and resource-aware (disk
//! floor + memory accountant gate every dispatch).

use crate::collection_index::CollectionIndex;
use crate::config::PipelineConfig;
use crate::converter::convert_shard;
use crate::error::{CdxError, Result};
use crate::meta_index::{self, build_master_index, build_year_index};
use crate::model::CollectionId;
use crate::progress::{ProgressStore, QuarantineReason, ShardStage};
use crate::shard_store::{ShardState, ShardStore};
use crate::sorter::{sort_shard, Cancel};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The "download" stage's interface to raw-shard acquisition. Downloading
/// is an external collaborator per spec section 1 ("the download
/// transport" is out of scope); the pipeline only needs to know which
/// shards a collection is supposed to have and that their raw bytes are on
/// disk before conversion can start.
pub trait Downloader: Send + Sync {
    fn expected_shards(&self, collection: &str) -> Result<Vec<u32>>;
    fn ensure_shard(&self, collection: &str, shard_id: u32) -> Result<()>;
}

/// Treats whatever is already present under the shard store as "expected":
/// every shard id discovered for the collection (raw, unsorted, or sorted)
/// is both expected and already downloaded. This backs tests and any
/// deployment where raw shards are staged onto disk by a separate,
/// out-of-scope transport before `ingest run` is invoked.
pub struct FilesystemDownloader {
    store: Arc<ShardStore>,
}

impl FilesystemDownloader {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self { store }
    }
}

impl Downloader for FilesystemDownloader {
    fn expected_shards(&self, collection: &str) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .store
            .list_shards(collection)?
            .into_iter()
            .map(|s| s.shard_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn ensure_shard(&self, collection: &str, shard_id: u32) -> Result<()> {
        let has_raw = self.store.raw_shard_path(collection, shard_id).is_file();
        let has_columnar = self.store.has_unsorted_or_sorted(collection, shard_id);
        if has_raw || has_columnar {
            Ok(())
        } else {
            Err(CdxError::InputUnreadable {
                path: self.store.raw_shard_path(collection, shard_id),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "raw shard absent"),
            })
        }
    }
}

/// Per-collection outcome of one orchestrator pass, surfaced to `ingest
/// status`.
#[derive(Debug, Clone)]
pub struct CollectionReport {
    pub collection: String,
    pub shard_count: usize,
    pub sorted_count: usize,
    pub quarantined_count: usize,
    pub indexed: bool,
}

struct ShutdownToken(Arc<AtomicBool>);

impl Cancel for ShutdownToken {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exponential backoff retry for transient failures, capped at
/// `max_attempts`. Deterministic ([`CdxError::is_transient`] false)
/// failures are returned immediately without retry.
fn retry_transient<T>(max_attempts: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let backoff_ms = 10u64 * 2u64.pow(attempt.min(6));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct Orchestrator {
    store: Arc<ShardStore>,
    index_root: PathBuf,
    progress: Arc<ProgressStore>,
    config: PipelineConfig,
    downloader: Arc<dyn Downloader>,
    shutdown: Arc<AtomicBool>,
    memory: Arc<crate::resources::MemoryAccountant>,
    pool: rayon::ThreadPool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ShardStore>,
        index_root: PathBuf,
        progress: Arc<ProgressStore>,
        config: PipelineConfig,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self> {
        let memory = Arc::new(crate::resources::MemoryAccountant::new(config.memory_budget_mb));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .map_err(|e| CdxError::Serialization(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            store,
            index_root,
            progress,
            config,
            downloader,
            shutdown: Arc::new(AtomicBool::new(false)),
            memory,
            pool,
        })
    }

    /// A clone-able handle other threads can use to request cooperative
    /// shutdown (spec section 4.6: "a stop signal causes the orchestrator
    /// to refuse new dispatches").
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Drives every collection in `collections` through as many stage
    /// transitions as resources and shutdown state allow, and returns a
    /// report per collection. Safe to call repeatedly (idempotent,
    /// resumable): collections already `indexed` with fresh meta-indexes
    /// perform no writes to canonical artifacts.
    pub fn run(&self, collections: &[String]) -> Result<Vec<CollectionReport>> {
        let mut reports = Vec::new();
        let mut touched_years = std::collections::BTreeSet::new();

        for collection in collections {
            if self.is_shutting_down() {
                break;
            }
            let (report, year) = self.advance_collection(collection)?;
            if report.indexed {
                touched_years.insert(year);
            }
            reports.push(report);
        }

        if !self.is_shutting_down() {
            for year in touched_years {
                self.rebuild_year_index(year)?;
            }
            self.rebuild_master_index()?;
        }

        Ok(reports)
    }

    fn advance_collection(&self, collection: &str) -> Result<(CollectionReport, u16)> {
        let id: CollectionId = collection
            .parse()
            .map_err(|_| CdxError::InvalidArguments(format!("invalid collection id {collection}")))?;

        let expected = self.downloader.expected_shards(collection)?;
        for &shard_id in &expected {
            if self.is_shutting_down() {
                break;
            }
            let _ = retry_transient(4, || self.downloader.ensure_shard(collection, shard_id));
        }

        self.run_stage_for_collection(collection, &expected, StagePass::Convert)?;
        self.run_stage_for_collection(collection, &expected, StagePass::Sort)?;

        let progress = self.progress.load(collection)?;
        let sorted_count = progress
            .shards
            .values()
            .filter(|s| s.stage as u8 >= ShardStage::Sorted as u8 && s.quarantined.is_none())
            .count();
        let quarantined_count = progress.shards.values().filter(|s| s.quarantined.is_some()).count();

        let mut indexed = progress.indexed;
        if !indexed
            && !progress.any_quarantined()
            && progress.all_shards_at_least(ShardStage::Sorted)
            && !self.is_shutting_down()
        {
            self.build_and_seal_collection_index(collection)?;
            self.progress.update(collection, |p| p.indexed = true)?;
            indexed = true;
        }

        Ok((
            CollectionReport {
                collection: collection.to_string(),
                shard_count: expected.len(),
                sorted_count,
                quarantined_count,
                indexed,
            },
            id.year,
        ))
    }

    fn run_stage_for_collection(
        &self,
        collection: &str,
        expected: &[u32],
        pass: StagePass,
    ) -> Result<()> {
        if self.is_shutting_down() {
            return Ok(());
        }
        let progress = self.progress.load(collection)?;
        let pending: Vec<u32> = expected
            .iter()
            .copied()
            .filter(|id| {
                let p = progress.shards.get(id);
                let quarantined = p.map(|s| s.quarantined.is_some()).unwrap_or(false);
                if quarantined {
                    return false;
                }
                let stage = p.map(|s| s.stage).unwrap_or(ShardStage::Pending);
                match pass {
                    StagePass::Convert => stage == ShardStage::Pending,
                    StagePass::Sort => stage == ShardStage::Converted,
                }
            })
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let shutdown = Arc::clone(&self.shutdown);
        let results: Vec<(u32, Result<()>)> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|&shard_id| {
                    if shutdown.load(Ordering::SeqCst) {
                        return (shard_id, Err(CdxError::Cancelled));
                    }
                    let outcome = match pass {
                        StagePass::Convert => {
                            retry_transient(4, || self.run_convert_task(collection, shard_id))
                        }
                        StagePass::Sort => {
                            retry_transient(4, || self.run_sort_task(collection, shard_id))
                        }
                    };
                    (shard_id, outcome)
                })
                .collect()
        });

        for (shard_id, outcome) in results {
            match outcome {
                Ok(()) => {
                    let next_stage = match pass {
                        StagePass::Convert => ShardStage::Converted,
                        StagePass::Sort => ShardStage::Sorted,
                    };
                    self.progress.update(collection, |p| {
                        p.shards.entry(shard_id).or_default().stage = next_stage;
                    })?;
                }
                Err(CdxError::Cancelled) => {}
                Err(e) if e.is_transient() => {
                    // Retries within the dispatch closure above already
                    // exhausted the backoff cap; leave the shard's stage
                    // unchanged so the next `run()` call retries it rather
                    // than quarantining a condition that may clear on its
                    // own (spec section 4.6/7: transient failures defer,
                    // they do not quarantine).
                    tracing::warn!(collection, shard_id, error = %e, "transient failure, deferring shard");
                }
                Err(e) => {
                    let reason = match &e {
                        CdxError::MalformedRateExceeded { .. } => QuarantineReason::MalformedRateExceeded,
                        _ => QuarantineReason::ArtifactCorrupted,
                    };
                    tracing::error!(collection, shard_id, error = %e, "shard quarantined");
                    self.progress.update(collection, |p| {
                        p.shards.entry(shard_id).or_default().quarantined = Some(reason);
                    })?;
                }
            }
        }
        Ok(())
    }

    fn run_convert_task(&self, collection: &str, shard_id: u32) -> Result<()> {
        let raw_path = self.store.raw_shard_path(collection, shard_id);
        crate::resources::check_disk_floor(
            &self.store.collection_dir(collection),
            self.config.min_free_space_gb,
            0,
        )?;
        let budget = self.config.per_task_budget_mb();
        let _lease = self.memory.acquire(budget)?;

        let mut rows = Vec::new();
        let report = convert_shard(&raw_path, self.config.malformed_threshold, |row| {
            rows.push(row);
            Ok(())
        })?;
        tracing::info!(
            collection,
            shard_id,
            rows = report.rows_written,
            malformed = report.lines_malformed,
            "converted shard"
        );
        self.store
            .write_columnar(collection, shard_id, &rows, ShardState::Unsorted)?;
        Ok(())
    }

    fn run_sort_task(&self, collection: &str, shard_id: u32) -> Result<()> {
        crate::resources::check_disk_floor(
            &self.store.collection_dir(collection),
            self.config.min_free_space_gb,
            0,
        )?;
        let budget = self.config.per_task_budget_mb();
        let _lease = self.memory.acquire(budget)?;

        let cancel = ShutdownToken(Arc::clone(&self.shutdown));
        let report = sort_shard(
            &self.store,
            collection,
            shard_id,
            self.config.batch_rows,
            &cancel,
        )?;
        tracing::info!(
            collection,
            shard_id,
            rows = report.row_count,
            runs = report.run_count,
            noop = report.was_noop,
            "sorted shard"
        );
        Ok(())
    }

    fn build_and_seal_collection_index(&self, collection: &str) -> Result<CollectionIndex> {
        let index = crate::indexer::build_collection_index(&self.store, collection)?;
        let path = meta_index::collection_index_path(&self.index_root, collection);
        index.write_to(&path)?;
        tracing::info!(collection, hosts = index.host_count(), "collection index sealed");
        Ok(index)
    }

    fn rebuild_year_index(&self, year: u16) -> Result<()> {
        static YEAR_BUILD_SERIAL: Mutex<()> = Mutex::new(());
        let _guard = YEAR_BUILD_SERIAL.lock().unwrap();
        let yi = build_year_index(&self.index_root, year, meta_index::now_unix())?;
        yi.write_to(&meta_index::year_index_path(&self.index_root, year))?;
        Ok(())
    }

    fn rebuild_master_index(&self) -> Result<()> {
        static MASTER_BUILD_SERIAL: Mutex<()> = Mutex::new(());
        let _guard = MASTER_BUILD_SERIAL.lock().unwrap();
        let mi = build_master_index(&self.index_root, meta_index::now_unix())?;
        mi.write_to(&meta_index::master_index_path(&self.index_root))?;
        Ok(())
    }

    /// Status of a single collection without performing any writes —
    /// backs `ingest status`.
    pub fn status(&self, collection: &str) -> Result<CollectionReport> {
        let id: CollectionId = collection
            .parse()
            .map_err(|_| CdxError::InvalidArguments(format!("invalid collection id {collection}")))?;
        let _ = id;
        let expected = self.downloader.expected_shards(collection)?;
        let progress = self.progress.load(collection)?;
        let sorted_count = progress
            .shards
            .values()
            .filter(|s| s.stage as u8 >= ShardStage::Sorted as u8 && s.quarantined.is_none())
            .count();
        let quarantined_count = progress.shards.values().filter(|s| s.quarantined.is_some()).count();
        Ok(CollectionReport {
            collection: collection.to_string(),
            shard_count: expected.len(),
            sorted_count,
            quarantined_count,
            indexed: progress.indexed,
        })
    }
}

#[derive(Clone, Copy)]
enum StagePass {
    Convert,
    Sort,
}
