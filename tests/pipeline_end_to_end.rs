//! Black-box integration tests driving the ingestion pipeline and query
//! engine end-to-end through their public API, covering the corpus's
//! concrete scenarios.

use cdx_index_engine::config::PipelineConfig;
use cdx_index_engine::orchestrator::{FilesystemDownloader, Orchestrator};
use cdx_index_engine::progress::ProgressStore;
use cdx_index_engine::query::{QueryEngine, QueryParams};
use cdx_index_engine::shard_store::ShardStore;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::Arc;

fn cdx_line(host: &str, n: usize, offset: u64, length: u64) -> String {
    format!(
        r#"x 202401010000{n:02} {{"url":"https://{host}/{n}","filename":"w.warc.gz","offset":{offset},"length":{length}}}"#
    )
}

fn write_raw_shard(store: &ShardStore, collection: &str, shard_id: u32, lines: &[String]) {
    let path = store.raw_shard_path(collection, shard_id);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(&path).unwrap();
    let mut enc = GzEncoder::new(file, Compression::default());
    for line in lines {
        writeln!(enc, "{line}").unwrap();
    }
    enc.finish().unwrap();
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        workers: 2,
        memory_budget_mb: 512,
        min_free_space_gb: 0,
        batch_rows: 4,
        malformed_threshold: 0.5,
        query_concurrency: 4,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    shard_root: std::path::PathBuf,
    index_root: std::path::PathBuf,
    progress_root: std::path::PathBuf,
}

impl Harness {
    fn new() -> Self {
        cdx_index_engine::logging::init_for_tests();
        let dir = tempfile::tempdir().unwrap();
        Self {
            shard_root: dir.path().join("shards"),
            index_root: dir.path().join("index"),
            progress_root: dir.path().join("progress"),
            _dir: dir,
        }
    }

    fn store(&self) -> ShardStore {
        ShardStore::new(&self.shard_root)
    }

    fn ingest(&self, collections: &[&str]) {
        let store = Arc::new(self.store());
        let progress = Arc::new(ProgressStore::new(&self.progress_root));
        let downloader = Arc::new(FilesystemDownloader::new(Arc::clone(&store)));
        let orch = Orchestrator::new(
            store,
            self.index_root.clone(),
            progress,
            test_config(),
            downloader,
        )
        .unwrap();
        let names: Vec<String> = collections.iter().map(|c| c.to_string()).collect();
        let reports = orch.run(&names).unwrap();
        for r in &reports {
            assert!(r.indexed, "collection {} did not reach indexed", r.collection);
        }
    }

    fn engine(&self) -> QueryEngine {
        QueryEngine::new(&self.shard_root, &self.index_root, 4).unwrap()
    }
}

#[test]
fn scenario_single_capture_round_trip() {
    let h = Harness::new();
    write_raw_shard(
        &h.store(),
        "CC-MAIN-2024-30",
        0,
        &[cdx_line("example.com", 0, 100, 50)],
    );
    h.ingest(&["CC-MAIN-2024-30"]);

    let resp = h.engine().query(&QueryParams::new("example.com"), None).unwrap();
    assert_eq!(resp.rows.len(), 1);
    assert_eq!(resp.rows[0].warc_filename, "w.warc.gz");
    assert_eq!(resp.rows[0].warc_offset, 100);
    assert_eq!(resp.rows[0].warc_length, 50);
}

#[test]
fn scenario_multi_shard_multi_capture() {
    let h = Harness::new();
    let store = h.store();
    let mut shard0: Vec<String> = (0..5).map(|n| cdx_line("example.com", n, n as u64, 10)).collect();
    shard0.push(cdx_line("other.org", 5, 50, 10));
    let shard1: Vec<String> = vec![
        cdx_line("example.com", 0, 200, 10),
        cdx_line("example.com", 1, 201, 10),
        cdx_line("example.com", 2, 202, 10),
        cdx_line("zzz.net", 3, 300, 10),
    ];
    write_raw_shard(&store, "CC-MAIN-2024-30", 0, &shard0);
    write_raw_shard(&store, "CC-MAIN-2024-30", 1, &shard1);
    h.ingest(&["CC-MAIN-2024-30"]);

    let resp = h.engine().query(&QueryParams::new("example.com"), None).unwrap();
    assert_eq!(resp.rows.len(), 8);
    assert!(resp.degraded_collections.is_empty());
    assert!(resp.degraded_runs.is_empty());
}

#[test]
fn scenario_prefix_query() {
    let h = Harness::new();
    write_raw_shard(
        &h.store(),
        "CC-MAIN-2024-30",
        0,
        &[
            cdx_line("a.example.com", 0, 1, 10),
            cdx_line("b.example.com", 1, 2, 10),
            cdx_line("other.org", 2, 3, 10),
        ],
    );
    h.ingest(&["CC-MAIN-2024-30"]);

    let mut params = QueryParams::new("example.com");
    params.host_prefix = true;
    let resp = h.engine().query(&params, None).unwrap();
    let hosts: Vec<_> = resp.rows.iter().map(|r| r.host.clone()).collect();
    assert_eq!(hosts, vec!["a.example.com", "b.example.com"]);
}

#[test]
fn scenario_year_filter() {
    let h = Harness::new();
    write_raw_shard(
        &h.store(),
        "CC-MAIN-2024-10",
        0,
        &[cdx_line("example.com", 0, 1, 10)],
    );
    write_raw_shard(
        &h.store(),
        "CC-MAIN-2025-05",
        0,
        &[cdx_line("example.com", 0, 2, 10)],
    );
    h.ingest(&["CC-MAIN-2024-10", "CC-MAIN-2025-05"]);

    let mut params = QueryParams::new("example.com");
    params.year_range = Some((2024, 2024));
    let resp = h.engine().query(&params, None).unwrap();
    assert_eq!(resp.rows.len(), 1);
    assert_eq!(resp.rows[0].collection, "CC-MAIN-2024-10");
}

#[test]
fn scenario_resume_after_crash_mid_sort() {
    let h = Harness::new();
    let store = h.store();
    for shard_id in 0..4u32 {
        write_raw_shard(
            &store,
            "CC-MAIN-2024-30",
            shard_id,
            &[cdx_line("example.com", shard_id as usize, shard_id as u64, 10)],
        );
    }

    // Simulate a crash mid-sort of shard 2: shards 0 and 1 already sorted,
    // shard 2 only has its unsorted columnar sibling, shard 3 untouched.
    let progress = Arc::new(ProgressStore::new(&h.progress_root));
    for shard_id in 0..2u32 {
        let raw = store.raw_shard_path("CC-MAIN-2024-30", shard_id);
        let mut rows = Vec::new();
        cdx_index_engine::converter::convert_shard(&raw, 0.1, |r| {
            rows.push(r);
            Ok(())
        })
        .unwrap();
        store
            .write_columnar("CC-MAIN-2024-30", shard_id, &rows, cdx_index_engine::shard_store::ShardState::Sorted)
            .unwrap();
        progress
            .update("CC-MAIN-2024-30", |p| {
                p.shards.entry(shard_id).or_default().stage = cdx_index_engine::progress::ShardStage::Sorted;
            })
            .unwrap();
    }
    {
        let raw = store.raw_shard_path("CC-MAIN-2024-30", 2);
        let mut rows = Vec::new();
        cdx_index_engine::converter::convert_shard(&raw, 0.1, |r| {
            rows.push(r);
            Ok(())
        })
        .unwrap();
        store
            .write_columnar("CC-MAIN-2024-30", 2, &rows, cdx_index_engine::shard_store::ShardState::Unsorted)
            .unwrap();
        progress
            .update("CC-MAIN-2024-30", |p| {
                p.shards.entry(2).or_default().stage = cdx_index_engine::progress::ShardStage::Converted;
            })
            .unwrap();
    }
    assert!(!store.has_sorted("CC-MAIN-2024-30", 2));

    let downloader = Arc::new(FilesystemDownloader::new(Arc::new(h.store())));
    let orch = Orchestrator::new(
        Arc::new(h.store()),
        h.index_root.clone(),
        progress,
        test_config(),
        downloader,
    )
    .unwrap();
    let reports = orch.run(&["CC-MAIN-2024-30".to_string()]).unwrap();
    assert!(reports[0].indexed);
    assert!(store.has_sorted("CC-MAIN-2024-30", 2));
    assert!(store.has_sorted("CC-MAIN-2024-30", 3));
}

#[test]
fn scenario_corrupted_shard_is_isolated_not_fatal_to_query() {
    let h = Harness::new();
    write_raw_shard(
        &h.store(),
        "CC-MAIN-2024-30",
        0,
        &[cdx_line("example.com", 0, 1, 10)],
    );
    write_raw_shard(
        &h.store(),
        "CC-MAIN-2024-30",
        1,
        &[cdx_line("example.com", 1, 2, 10)],
    );
    h.ingest(&["CC-MAIN-2024-30"]);

    let store = h.store();
    let sorted_path = store.sorted_shard_path("CC-MAIN-2024-30", 1);
    std::fs::write(&sorted_path, b"\x00\x00\x00").unwrap();

    let resp = h.engine().query(&QueryParams::new("example.com"), None).unwrap();
    assert_eq!(resp.rows.len(), 1);
    assert_eq!(resp.degraded_runs.len(), 1);
    assert_eq!(resp.degraded_runs[0].shard_id, 1);
}

#[test]
fn rerunning_ingest_over_fully_ingested_corpus_is_idempotent() {
    let h = Harness::new();
    write_raw_shard(
        &h.store(),
        "CC-MAIN-2024-30",
        0,
        &[cdx_line("example.com", 0, 1, 10)],
    );
    h.ingest(&["CC-MAIN-2024-30"]);

    let sorted_path = h.store().sorted_shard_path("CC-MAIN-2024-30", 0);
    let before = std::fs::metadata(&sorted_path).unwrap().modified().unwrap();
    h.ingest(&["CC-MAIN-2024-30"]);
    let after = std::fs::metadata(&sorted_path).unwrap().modified().unwrap();
    assert_eq!(before, after);
}
