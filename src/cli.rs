//! Subcommand surface from spec section 6: `ingest run`, `ingest status`,
//! `query host`, `index rebuild-meta`. Argument shape, not flag-exact.

use crate::config::PipelineConfig;
use crate::error::CdxError;
use crate::meta_index::{self, build_master_index, build_year_index, MasterIndex};
use crate::orchestrator::{FilesystemDownloader, Orchestrator};
use crate::progress::ProgressStore;
use crate::query::{Fields, QueryEngine, QueryParams};
use crate::shard_store::ShardStore;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "cdxctl", about = "Resumable CDX ingestion and host-scoped pointer index")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Root directory for raw/unsorted/sorted shard storage.
    #[arg(long, global = true, default_value = "./data/shards")]
    pub shard_root: PathBuf,

    /// Root directory for collection/year/master index artifacts.
    #[arg(long, global = true, default_value = "./data/index")]
    pub index_root: PathBuf,

    /// Root directory for per-collection progress records.
    #[arg(long, global = true, default_value = "./data/progress")]
    pub progress_root: PathBuf,
}

#[derive(Subcommand)]
pub enum Command {
    /// Drive the ingestion pipeline.
    Ingest {
        #[command(subcommand)]
        action: IngestAction,
    },
    /// Query the pointer index.
    Query {
        #[command(subcommand)]
        action: QueryAction,
    },
    /// Rebuild year or master meta-indexes.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Subcommand)]
pub enum IngestAction {
    Run(IngestRunArgs),
    Status(IngestStatusArgs),
}

#[derive(Args)]
pub struct IngestRunArgs {
    /// Collections to ingest, e.g. CC-MAIN-2024-30. Defaults to every
    /// collection with shards already staged under `--shard-root`.
    #[arg(long = "collections", value_delimiter = ',')]
    pub collections: Vec<String>,

    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long = "memory-budget")]
    pub memory_budget_mb: Option<u64>,

    #[arg(long = "min-free-space")]
    pub min_free_space_gb: Option<u64>,
}

#[derive(Args)]
pub struct IngestStatusArgs {
    #[arg(long)]
    pub collection: Option<String>,
}

#[derive(Subcommand)]
pub enum QueryAction {
    Host(QueryHostArgs),
}

#[derive(Args)]
pub struct QueryHostArgs {
    pub host: String,

    #[arg(long)]
    pub prefix: bool,

    /// `Y1:Y2` inclusive year range.
    #[arg(long = "year-range")]
    pub year_range: Option<String>,

    #[arg(long = "collection", value_delimiter = ',')]
    pub collection: Vec<String>,

    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub with_url: bool,

    #[arg(long)]
    pub with_timestamp: bool,

    /// Abort and return partial results after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
pub enum IndexAction {
    RebuildMeta(RebuildMetaArgs),
}

#[derive(Args)]
pub struct RebuildMetaArgs {
    #[arg(long)]
    pub year: Option<u16>,

    #[arg(long)]
    pub master: bool,
}

/// Entry point called from `main`. Internally errors are `CdxError` so the
/// caller can recover an exit code via [`CdxError::exit_code`] even though
/// the signature is `anyhow::Result` for ergonomic `?` propagation.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Ingest { action } => run_ingest(action, &cli.shard_root, &cli.index_root, &cli.progress_root),
        Command::Query { action } => run_query(action, &cli.shard_root, &cli.index_root),
        Command::Index { action } => run_index(action, &cli.index_root),
    }
}

fn discover_collections(index_root: &std::path::Path) -> Vec<String> {
    let by_collection = index_root.join("by_collection");
    let mut found = HashSet::new();
    if let Ok(entries) = std::fs::read_dir(&by_collection) {
        for entry in entries.flatten() {
            if let Some(stem) = entry
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".pointer_index"))
            {
                found.insert(stem.to_string());
            }
        }
    }
    let mut out: Vec<_> = found.into_iter().collect();
    out.sort();
    out
}

fn run_ingest(
    action: IngestAction,
    shard_root: &std::path::Path,
    index_root: &std::path::Path,
    progress_root: &std::path::Path,
) -> anyhow::Result<()> {
    let store = Arc::new(ShardStore::new(shard_root));
    let progress = Arc::new(ProgressStore::new(progress_root));

    match action {
        IngestAction::Run(args) => {
            let mut config = PipelineConfig::default();
            if let Some(w) = args.workers {
                config.workers = w;
            }
            if let Some(m) = args.memory_budget_mb {
                config.memory_budget_mb = m;
            }
            if let Some(g) = args.min_free_space_gb {
                config.min_free_space_gb = g;
            }

            let downloader = Arc::new(FilesystemDownloader::new(Arc::clone(&store)));
            let orch = Orchestrator::new(
                Arc::clone(&store),
                index_root.to_path_buf(),
                Arc::clone(&progress),
                config,
                downloader,
            )
            .context("failed to initialize orchestrator")?;

            let collections = if args.collections.is_empty() {
                discover_from_shards(&store)
            } else {
                args.collections
            };
            if collections.is_empty() {
                return Err(CdxError::InvalidArguments(
                    "no collections to ingest: pass --collections or stage raw shards under the shard root".into(),
                )
                .into());
            }

            let bar = ProgressBar::new(collections.len() as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            let reports = orch.run(&collections).map_err(|e| anyhow::Error::new(e))?;
            for report in &reports {
                bar.inc(1);
                bar.set_message(report.collection.clone());
            }
            bar.finish_and_clear();

            for report in reports {
                println!(
                    "{}: {}/{} sorted, {} quarantined, indexed={}",
                    report.collection,
                    report.sorted_count,
                    report.shard_count,
                    report.quarantined_count,
                    report.indexed
                );
            }
            Ok(())
        }
        IngestAction::Status(args) => {
            let downloader = Arc::new(FilesystemDownloader::new(Arc::clone(&store)));
            let orch = Orchestrator::new(
                store,
                index_root.to_path_buf(),
                progress,
                PipelineConfig::default(),
                downloader,
            )
            .context("failed to initialize orchestrator")?;

            let collections = match args.collection {
                Some(c) => vec![c],
                None => discover_collections(index_root),
            };
            for collection in collections {
                let report = orch.status(&collection).map_err(|e| anyhow::Error::new(e))?;
                println!(
                    "{}: {}/{} sorted, {} quarantined, indexed={}",
                    report.collection,
                    report.sorted_count,
                    report.shard_count,
                    report.quarantined_count,
                    report.indexed
                );
            }
            Ok(())
        }
    }
}

fn discover_from_shards(store: &ShardStore) -> Vec<String> {
    let root = store.collection_dir("");
    let parent = root.parent().unwrap_or(&root).to_path_buf();
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&parent) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
    }
    out.sort();
    out
}

fn run_query(action: QueryAction, shard_root: &std::path::Path, index_root: &std::path::Path) -> anyhow::Result<()> {
    match action {
        QueryAction::Host(args) => {
            let config = PipelineConfig::default();
            let engine = QueryEngine::new(shard_root, index_root, config.query_concurrency)
                .context("failed to initialize query engine")?;

            let year_range = match args.year_range {
                Some(s) => {
                    let (lo, hi) = s.split_once(':').ok_or_else(|| {
                        CdxError::InvalidArguments("--year-range must be of the form Y1:Y2".into())
                    })?;
                    let lo = lo.parse::<u16>().map_err(|_| {
                        CdxError::InvalidArguments(format!("invalid --year-range start: {lo}"))
                    })?;
                    let hi = hi.parse::<u16>().map_err(|_| {
                        CdxError::InvalidArguments(format!("invalid --year-range end: {hi}"))
                    })?;
                    Some((lo, hi))
                }
                None => None,
            };

            let params = QueryParams {
                host: args.host,
                host_prefix: args.prefix,
                year_range,
                collections: if args.collection.is_empty() {
                    None
                } else {
                    Some(args.collection.into_iter().collect())
                },
                timestamp_range: None,
                limit: args.limit,
                fields: Fields {
                    url: args.with_url,
                    timestamp: args.with_timestamp,
                },
            };
            let deadline = args.timeout_secs.map(|s| Instant::now() + Duration::from_secs(s));

            let response = engine.query(&params, deadline).map_err(|e| anyhow::Error::new(e))?;
            for row in &response.rows {
                println!(
                    "{}\t{}\t{}\t{}{}{}",
                    row.collection,
                    row.host,
                    row.warc_filename,
                    row.warc_offset,
                    row.url.as_ref().map(|u| format!("\t{u}")).unwrap_or_default(),
                    row.timestamp.as_ref().map(|t| format!("\t{t}")).unwrap_or_default(),
                );
            }
            if !response.degraded_collections.is_empty() {
                eprintln!("degraded collections: {:?}", response.degraded_collections);
            }
            if !response.degraded_runs.is_empty() {
                eprintln!(
                    "degraded runs: {:?}",
                    response
                        .degraded_runs
                        .iter()
                        .map(|r| format!("{}/{}", r.collection, r.shard_id))
                        .collect::<Vec<_>>()
                );
            }
            if response.stats.timed_out {
                eprintln!("query deadline exceeded: results are partial");
            }
            Ok(())
        }
    }
}

fn run_index(action: IndexAction, index_root: &std::path::Path) -> anyhow::Result<()> {
    match action {
        IndexAction::RebuildMeta(args) => {
            if !args.master && args.year.is_none() {
                return Err(CdxError::InvalidArguments("specify --year YYYY or --master".into()).into());
            }
            if let Some(year) = args.year {
                let yi = build_year_index(index_root, year, meta_index::now_unix())
                    .map_err(|e: CdxError| anyhow::Error::new(e))?;
                yi.write_to(&meta_index::year_index_path(index_root, year))?;
                println!("rebuilt year index {year}: {} collections", yi.collections.len());
            }
            if args.master {
                let master: MasterIndex = build_master_index(index_root, meta_index::now_unix())
                    .map_err(|e| anyhow::Error::new(e))?;
                master.write_to(&meta_index::master_index_path(index_root))?;
                println!("rebuilt master index: {} years", master.years.len());
            }
            Ok(())
        }
    }
}
