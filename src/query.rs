//! C7: answers `query(host, filters, limit)` over the corpus by fanning out
//! through the master -> year -> collection index hierarchy and
//! materializing pointer rows by random-access shard reads (spec section 4.7).

use crate::collection_index::CollectionIndex;
use crate::error::{CdxError, Result};
use crate::meta_index::{self, MasterIndex, YearIndex};
use crate::model::HostRun;
use crate::shard_store::ShardStore;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

/// Which optional fields to project alongside the always-present pointer
/// triple. Defaults to neither, matching the logical interface's default
/// field set (`{warc_filename, warc_offset, warc_length}`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Fields {
    pub url: bool,
    pub timestamp: bool,
}

#[derive(Debug, Clone)]
pub struct QueryParams {
    pub host: String,
    pub host_prefix: bool,
    pub year_range: Option<(u16, u16)>,
    pub collections: Option<HashSet<String>>,
    pub timestamp_range: Option<(String, String)>,
    pub limit: Option<usize>,
    pub fields: Fields,
}

impl QueryParams {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            host_prefix: false,
            year_range: None,
            collections: None,
            timestamp_range: None,
            limit: None,
            fields: Fields::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub collection: String,
    pub host: String,
    pub url: Option<String>,
    pub timestamp: Option<String>,
    pub warc_filename: String,
    pub warc_offset: u64,
    pub warc_length: u64,
}

#[derive(Debug, Clone)]
pub struct DegradedRun {
    pub collection: String,
    pub shard_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    pub collections_scanned: usize,
    pub runs_materialized: usize,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub rows: Vec<ResultRow>,
    pub degraded_collections: Vec<String>,
    pub degraded_runs: Vec<DegradedRun>,
    pub stats: QueryStats,
}

pub struct QueryEngine {
    store: ShardStore,
    index_root: PathBuf,
    pool: rayon::ThreadPool,
}

impl QueryEngine {
    pub fn new(shard_root: impl Into<PathBuf>, index_root: impl Into<PathBuf>, concurrency: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .build()
            .map_err(|e| CdxError::Serialization(format!("failed to build query pool: {e}")))?;
        Ok(Self {
            store: ShardStore::new(shard_root),
            index_root: index_root.into(),
            pool,
        })
    }

    /// Runs `params` against the corpus, optionally bounded by `deadline`
    /// (an absolute instant). On expiry, the response is returned with
    /// whatever rows were already materialized and `stats.timed_out = true`.
    pub fn query(&self, params: &QueryParams, deadline: Option<Instant>) -> Result<QueryResponse> {
        let candidates = self.plan(params)?;

        let mut response = QueryResponse::default();
        response.stats.collections_scanned = candidates.len();

        for (collection, index_path) in candidates {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    response.stats.timed_out = true;
                    break;
                }
            }
            match CollectionIndex::read_from(&index_path) {
                Err(_) => response.degraded_collections.push(collection),
                Ok(index) => {
                    let matches = self.lookup(&index, params);
                    let materialized = self.materialize(&collection, matches, params);
                    response.degraded_runs.extend(materialized.degraded);
                    response.stats.runs_materialized += materialized.runs_materialized;
                    response.rows.extend(materialized.rows);
                    if let Some(limit) = params.limit {
                        if response.rows.len() >= limit {
                            response.rows.truncate(limit);
                            return Ok(response);
                        }
                    }
                }
            }
        }

        Ok(response)
    }

    /// Planning step: master index -> candidate years -> year indexes ->
    /// candidate `(collection, collection_index_path)` pairs, in
    /// `BTreeMap` (deterministic) order.
    fn plan(&self, params: &QueryParams) -> Result<Vec<(String, PathBuf)>> {
        let master = MasterIndex::read_from(&meta_index::master_index_path(&self.index_root))
            .unwrap_or(MasterIndex {
                years: Default::default(),
            });

        let mut out = Vec::new();
        for (&year, summary) in master.years.iter() {
            if let Some((lo, hi)) = params.year_range {
                if year < lo || year > hi {
                    continue;
                }
            }
            let Ok(year_index) = YearIndex::read_from(&summary.index_path) else {
                continue;
            };
            for (collection, cs) in year_index.collections.iter() {
                if let Some(allowed) = &params.collections {
                    if !allowed.contains(collection) {
                        continue;
                    }
                }
                out.push((collection.clone(), cs.index_path.clone()));
            }
        }
        Ok(out)
    }

    /// Lookup fan-out step, scoped to one already-opened collection index.
    /// `Q` (the pool's thread count) bounds concurrency across collections
    /// at the caller; within one collection the lookup itself is O(log N).
    fn lookup(&self, index: &CollectionIndex, params: &QueryParams) -> Vec<(String, HostRun)> {
        if params.host_prefix {
            index
                .lookup_prefix(&params.host)
                .into_iter()
                .flat_map(|(host, runs)| runs.iter().map(move |r| (host.to_string(), *r)))
                .collect()
        } else {
            index
                .lookup(&params.host)
                .map(|runs| runs.iter().map(|r| (params.host.clone(), *r)).collect())
                .unwrap_or_default()
        }
    }

    /// Materialization step: random-access read of each run's row range
    /// from its sorted shard, in parallel up to the pool's concurrency,
    /// followed by the timestamp-filter secondary pass.
    fn materialize(
        &self,
        collection: &str,
        matches: Vec<(String, HostRun)>,
        params: &QueryParams,
    ) -> MaterializeOutcome {
        let results: Vec<MaterializeOutcome> = self.pool.install(|| {
            matches
                .par_iter()
                .map(|(host, run)| self.materialize_one(collection, host, *run, params))
                .collect()
        });

        let mut combined = MaterializeOutcome::default();
        for r in results {
            combined.rows.extend(r.rows);
            combined.degraded.extend(r.degraded);
            combined.runs_materialized += r.runs_materialized;
        }
        combined
    }

    fn materialize_one(
        &self,
        collection: &str,
        host: &str,
        run: HostRun,
        params: &QueryParams,
    ) -> MaterializeOutcome {
        let mut out = MaterializeOutcome::default();
        let reader = match self.store.open_sorted(collection, run.shard_id) {
            Ok(r) => r,
            Err(_) => {
                out.degraded.push(DegradedRun {
                    collection: collection.to_string(),
                    shard_id: run.shard_id,
                });
                return out;
            }
        };
        let rows = match reader.read_rows(run.row_offset, run.row_count) {
            Ok(rows) => rows,
            Err(_) => {
                out.degraded.push(DegradedRun {
                    collection: collection.to_string(),
                    shard_id: run.shard_id,
                });
                return out;
            }
        };
        out.runs_materialized += 1;

        for row in rows {
            if let Some((lo, hi)) = &params.timestamp_range {
                if row.timestamp.as_str() < lo.as_str() || row.timestamp.as_str() > hi.as_str() {
                    continue;
                }
            }
            out.rows.push(ResultRow {
                collection: collection.to_string(),
                host: host.to_string(),
                url: params.fields.url.then(|| row.url.clone()),
                timestamp: params.fields.timestamp.then(|| row.timestamp.clone()),
                warc_filename: row.warc_filename,
                warc_offset: row.warc_offset,
                warc_length: row.warc_length,
            });
        }
        out
    }
}

#[derive(Default)]
struct MaterializeOutcome {
    rows: Vec<ResultRow>,
    degraded: Vec<DegradedRun>,
    runs_materialized: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection_index::{CollectionIndexBuilder, RawRunTuple};
    use crate::meta_index::{build_master_index, build_year_index};
    use crate::model::{host_of, reverse_host, CaptureRow};
    use crate::shard_store::ShardState;

    fn row(host: &str, ts: &str, offset: u64) -> CaptureRow {
        let url = format!("https://{host}/");
        CaptureRow {
            host_reversed: reverse_host(host),
            host: host_of(&url).unwrap(),
            url,
            timestamp: ts.into(),
            warc_filename: "w.warc.gz".into(),
            warc_offset: offset,
            warc_length: 1,
        }
    }

    fn seed_collection(
        dir: &std::path::Path,
        store: &ShardStore,
        collection: &str,
        rows: Vec<CaptureRow>,
    ) {
        store
            .write_columnar(collection, 0, &rows, ShardState::Sorted)
            .unwrap();
        let mut b = CollectionIndexBuilder::new(collection);
        b.record_shard_row_count(0, rows.len() as u64);
        for (i, r) in rows.iter().enumerate() {
            b.push(RawRunTuple {
                host: r.host.clone(),
                host_reversed: r.host_reversed.clone(),
                run: HostRun::new(0, i as u64, 1),
            });
        }
        let idx = b.build();
        let path = meta_index::collection_index_path(dir, collection);
        idx.write_to(&path).unwrap();
    }

    fn seed_meta(dir: &std::path::Path, year: u16) {
        let yi = build_year_index(dir, year, 1).unwrap();
        yi.write_to(&meta_index::year_index_path(dir, year)).unwrap();
        let master = build_master_index(dir, 1).unwrap();
        master
            .write_to(&meta_index::master_index_path(dir))
            .unwrap();
    }

    #[test]
    fn exact_host_query_returns_pointer_only_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let shard_root = dir.path().join("shards");
        let index_root = dir.path().join("index");
        let store = ShardStore::new(&shard_root);

        seed_collection(
            &index_root,
            &store,
            "CC-MAIN-2024-30",
            vec![row("example.com", "20240101000000", 100)],
        );
        seed_meta(&index_root, 2024);

        let engine = QueryEngine::new(&shard_root, &index_root, 4).unwrap();
        let params = QueryParams::new("example.com");
        let resp = engine.query(&params, None).unwrap();

        assert_eq!(resp.rows.len(), 1);
        assert_eq!(resp.rows[0].warc_offset, 100);
        assert!(resp.rows[0].url.is_none());
        assert!(resp.degraded_collections.is_empty());
    }

    #[test]
    fn prefix_query_matches_subdomains_only() {
        let dir = tempfile::tempdir().unwrap();
        let shard_root = dir.path().join("shards");
        let index_root = dir.path().join("index");
        let store = ShardStore::new(&shard_root);

        seed_collection(
            &index_root,
            &store,
            "CC-MAIN-2024-30",
            vec![
                row("a.example.com", "20240101000000", 1),
                row("b.example.com", "20240101000000", 2),
                row("other.org", "20240101000000", 3),
            ],
        );
        seed_meta(&index_root, 2024);

        let engine = QueryEngine::new(&shard_root, &index_root, 4).unwrap();
        let mut params = QueryParams::new("example.com");
        params.host_prefix = true;
        let resp = engine.query(&params, None).unwrap();

        assert_eq!(resp.rows.len(), 2);
    }

    #[test]
    fn year_range_filters_out_other_years() {
        let dir = tempfile::tempdir().unwrap();
        let shard_root = dir.path().join("shards");
        let index_root = dir.path().join("index");
        let store = ShardStore::new(&shard_root);

        seed_collection(
            &index_root,
            &store,
            "CC-MAIN-2024-10",
            vec![row("example.com", "20240101000000", 1)],
        );
        seed_collection(
            &index_root,
            &store,
            "CC-MAIN-2025-05",
            vec![row("example.com", "20250101000000", 2)],
        );
        seed_meta(&index_root, 2024);
        seed_meta(&index_root, 2025);

        let engine = QueryEngine::new(&shard_root, &index_root, 4).unwrap();
        let mut params = QueryParams::new("example.com");
        params.year_range = Some((2024, 2024));
        let resp = engine.query(&params, None).unwrap();

        assert_eq!(resp.rows.len(), 1);
        assert_eq!(resp.rows[0].collection, "CC-MAIN-2024-10");
    }

    #[test]
    fn corrupted_collection_index_is_reported_degraded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let shard_root = dir.path().join("shards");
        let index_root = dir.path().join("index");
        std::fs::create_dir_all(index_root.join("by_collection")).unwrap();
        std::fs::write(
            meta_index::collection_index_path(&index_root, "CC-MAIN-2024-30"),
            b"garbage",
        )
        .unwrap();
        seed_meta(&index_root, 2024);

        let engine = QueryEngine::new(&shard_root, &index_root, 4).unwrap();
        let params = QueryParams::new("example.com");
        let resp = engine.query(&params, None).unwrap();

        assert!(resp.rows.is_empty());
        assert_eq!(resp.degraded_collections, vec!["CC-MAIN-2024-30".to_string()]);
    }

    #[test]
    fn missing_sorted_shard_is_reported_as_degraded_run() {
        let dir = tempfile::tempdir().unwrap();
        let shard_root = dir.path().join("shards");
        let index_root = dir.path().join("index");
        let store = ShardStore::new(&shard_root);

        let mut b = CollectionIndexBuilder::new("CC-MAIN-2024-30");
        b.record_shard_row_count(0, 1);
        b.push(RawRunTuple {
            host: "example.com".into(),
            host_reversed: reverse_host("example.com"),
            run: HostRun::new(0, 0, 1),
        });
        let idx = b.build();
        idx.write_to(&meta_index::collection_index_path(&index_root, "CC-MAIN-2024-30"))
            .unwrap();
        seed_meta(&index_root, 2024);
        let _ = &store; // shard deliberately never written

        let engine = QueryEngine::new(&shard_root, &index_root, 4).unwrap();
        let params = QueryParams::new("example.com");
        let resp = engine.query(&params, None).unwrap();

        assert!(resp.rows.is_empty());
        assert_eq!(resp.degraded_runs.len(), 1);
        assert_eq!(resp.degraded_runs[0].shard_id, 0);
    }

    #[test]
    fn limit_truncates_results() {
        let dir = tempfile::tempdir().unwrap();
        let shard_root = dir.path().join("shards");
        let index_root = dir.path().join("index");
        let store = ShardStore::new(&shard_root);

        seed_collection(
            &index_root,
            &store,
            "CC-MAIN-2024-30",
            vec![
                row("a.com", "20240101000000", 1),
                row("b.com", "20240101000000", 2),
                row("c.com", "20240101000000", 3),
            ],
        );
        seed_meta(&index_root, 2024);

        let engine = QueryEngine::new(&shard_root, &index_root, 4).unwrap();
        let mut params = QueryParams::new("a.com");
        params.limit = Some(1);
        let resp = engine.query(&params, None).unwrap();
        assert_eq!(resp.rows.len(), 1);
    }
}
