//! Batch pipeline
//!
//! Jobs run in fixed-size batches. Each batch goes through three phases in
//! order, and the next batch starts only after the previous one committed:
//!
//! 1. the driver loads every page of the batch and leaves trace files
//! 2. the batch's trace files are decoded and attributed into one counter
//! 3. the counter and the batch ledger are committed to the store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use glob::Pattern;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::analyze::{analyze_document, is_http_page, ApiCounter};
use crate::config::{Config, Discovery};
use crate::driver::{Driver, Job};
use crate::store::AggregateStore;
use crate::trace::{TraceDocument, TraceError};

/// What happened to one trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Analyzed,
    Oversized,
    Unreadable,
    Corrupt,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Analyzed => "analyzed",
            TraceStatus::Oversized => "oversized",
            TraceStatus::Unreadable => "unreadable",
            TraceStatus::Corrupt => "corrupt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceFileRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub status: TraceStatus,
    pub detail: Option<String>,
}

impl TraceFileRecord {
    fn skipped(path: &Path, size_bytes: u64, status: TraceStatus, detail: String) -> Self {
        Self {
            path: path.to_path_buf(),
            size_bytes,
            sha256: None,
            status,
            detail: Some(detail),
        }
    }
}

/// Ledger entry for one batch.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub run_id: Uuid,
    pub index: usize,
    pub job_count: usize,
    pub started_at: DateTime<Utc>,
    pub traces: Vec<TraceFileRecord>,
}

impl BatchRecord {
    pub fn analyzed(&self) -> usize {
        self.traces
            .iter()
            .filter(|t| t.status == TraceStatus::Analyzed)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.traces.len() - self.analyzed()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub traces_analyzed: usize,
    pub traces_skipped: usize,
    pub rows_merged: usize,
    pub calls_merged: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub report_dir: PathBuf,
    pub batch_size: usize,
    pub discovery: Discovery,
    pub max_trace_bytes: u64,
    pub clear_after_analysis: bool,
    pub patterns: Vec<Pattern>,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let patterns = config
            .reports
            .patterns
            .iter()
            .map(|p| Pattern::new(p).with_context(|| format!("Invalid trace pattern `{}`", p)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            report_dir: config.report_dir(),
            batch_size: config.batch_size(),
            discovery: config.reports.discovery,
            max_trace_bytes: config.reports.max_trace_bytes,
            clear_after_analysis: config.reports.clear_after_analysis,
            patterns,
        })
    }

    /// True when later batches would analyse earlier batches' traces again.
    pub fn rereads_traces(&self, job_count: usize) -> bool {
        self.discovery == Discovery::Directory
            && !self.clear_after_analysis
            && job_count > self.batch_size.max(1)
    }
}

pub struct Pipeline<D: Driver> {
    jobs: Vec<Job>,
    driver: D,
    store: AggregateStore,
    options: PipelineOptions,
    run_id: Uuid,
}

impl<D: Driver> Pipeline<D> {
    /// Build a pipeline, creating the report directory if needed.
    pub async fn create(
        jobs: Vec<Job>,
        driver: D,
        store: AggregateStore,
        options: PipelineOptions,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&options.report_dir)
            .await
            .with_context(|| format!("Failed to create {}", options.report_dir.display()))?;

        if options.rereads_traces(jobs.len()) {
            warn!(
                jobs = jobs.len(),
                batch_size = options.batch_size,
                "directory discovery without clearing re-analyses earlier batches' traces"
            );
        }

        Ok(Self {
            jobs,
            driver,
            store,
            options,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    pub fn into_store(self) -> AggregateStore {
        self.store
    }

    /// Run every batch in order.
    ///
    /// With no jobs and directory discovery this is a single analysis-only
    /// batch over whatever the report directory already holds.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let jobs = std::mem::take(&mut self.jobs);
        let mut summary = RunSummary::default();

        if jobs.is_empty() && self.options.discovery == Discovery::Directory {
            self.run_batch(0, &[], &mut summary).await?;
        }
        for (index, batch) in jobs.chunks(self.options.batch_size.max(1)).enumerate() {
            self.run_batch(index, batch, &mut summary).await?;
        }

        self.jobs = jobs;
        info!(
            run = %self.run_id,
            batches = summary.batches,
            analyzed = summary.traces_analyzed,
            skipped = summary.traces_skipped,
            rows = summary.rows_merged,
            "run complete"
        );
        Ok(summary)
    }

    async fn run_batch(
        &mut self,
        index: usize,
        jobs: &[Job],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let started_at = Utc::now();
        info!(batch = index, jobs = jobs.len(), "starting batch");

        let produced = self.driver.process_jobs(jobs).await;
        self.driver.close().await.context("Failed to close driver")?;
        let produced = produced.context("Driver failed")?;

        let paths: Vec<PathBuf> = match self.options.discovery {
            Discovery::Batch => produced
                .into_iter()
                .filter(|p| matches_patterns(p, &self.options.patterns))
                .collect(),
            Discovery::Directory => {
                discover_traces(&self.options.report_dir, &self.options.patterns)?
            }
        };

        let mut counter = ApiCounter::new();
        let traces = analyze_files(&paths, self.options.max_trace_bytes, &mut counter).await;

        let record = BatchRecord {
            run_id: self.run_id,
            index,
            job_count: jobs.len(),
            started_at,
            traces,
        };
        self.store
            .commit_batch(&record, &counter)
            .with_context(|| format!("Failed to store batch {}", index))?;

        summary.batches += 1;
        summary.traces_analyzed += record.analyzed();
        summary.traces_skipped += record.skipped();
        summary.rows_merged += counter.len();
        summary.calls_merged += counter.total_calls();
        info!(
            batch = index,
            analyzed = record.analyzed(),
            skipped = record.skipped(),
            rows = counter.len(),
            "batch stored"
        );

        if self.options.clear_after_analysis {
            clear_analyzed(&record).await;
        }
        Ok(())
    }
}

/// Trace files directly inside `dir` whose names match any pattern.
pub fn discover_traces(dir: &Path, patterns: &[Pattern]) -> Result<Vec<PathBuf>> {
    let mut paths = vec![];
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        if entry.file_type().is_file() && matches_patterns(entry.path(), patterns) {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

fn matches_patterns(path: &Path, patterns: &[Pattern]) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |name| patterns.iter().any(|p| p.matches(name)))
}

/// Analyse files one after another into `counter`.
pub async fn analyze_files(
    paths: &[PathBuf],
    max_trace_bytes: u64,
    counter: &mut ApiCounter,
) -> Vec<TraceFileRecord> {
    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        records.push(analyze_file(path, max_trace_bytes, counter).await);
    }
    records
}

/// Analyse one trace file. Failures are logged and reported, never returned.
pub async fn analyze_file(
    path: &Path,
    max_trace_bytes: u64,
    counter: &mut ApiCounter,
) -> TraceFileRecord {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat trace, skipping");
            return TraceFileRecord::skipped(path, 0, TraceStatus::Unreadable, e.to_string());
        }
    };
    if size > max_trace_bytes {
        warn!(path = %path.display(), size, limit = max_trace_bytes, "trace too large, skipping");
        return TraceFileRecord::skipped(
            path,
            size,
            TraceStatus::Oversized,
            format!("{} bytes exceeds {}", size, max_trace_bytes),
        );
    }

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read trace, skipping");
            return TraceFileRecord::skipped(path, size, TraceStatus::Unreadable, e.to_string());
        }
    };
    let digest = hex::encode(Sha256::digest(&bytes));

    let result = TraceDocument::from_file_bytes(path, &bytes, max_trace_bytes)
        .and_then(|doc| analyze_document(&doc, is_http_page, counter));
    let (status, detail) = match result {
        Ok(stats) => (
            TraceStatus::Analyzed,
            format!("{} samples, {} calls recorded", stats.samples, stats.recorded),
        ),
        Err(e @ TraceError::TooLarge { .. }) => {
            warn!(path = %path.display(), error = %e, "trace too large, skipping");
            (TraceStatus::Oversized, e.to_string())
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt trace, skipping");
            (TraceStatus::Corrupt, e.to_string())
        }
    };

    TraceFileRecord {
        path: path.to_path_buf(),
        size_bytes: size,
        sha256: Some(digest),
        status,
        detail: Some(detail),
    }
}

async fn clear_analyzed(record: &BatchRecord) {
    for trace in record.traces.iter().filter(|t| t.status == TraceStatus::Analyzed) {
        if let Err(e) = tokio::fs::remove_file(&trace.path).await {
            warn!(path = %trace.path.display(), error = %e, "failed to remove trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::SourceKey;
    use crate::driver::{IdleDriver, StartTrigger, WaitCondition};
    use crate::trace::fixture::{document_json, single_call};

    const API: &str = "(DOM) localStorage.getItem";
    const TOP: &str = "https://site.test/";

    fn trace_bytes() -> Vec<u8> {
        let thread = single_call(API);
        serde_json::to_vec(&document_json(&[(1, TOP, None)], &[&thread])).unwrap()
    }

    fn source() -> SourceKey {
        SourceKey {
            first_party: Some(TOP.into()),
            third_party: Some(TOP.into()),
            script_url: Some("https://site.test/app.js".into()),
            valid_script_url: Some("https://site.test/app.js".into()),
        }
    }

    fn options(dir: &Path, discovery: Discovery) -> PipelineOptions {
        PipelineOptions {
            report_dir: dir.to_path_buf(),
            batch_size: 2,
            discovery,
            max_trace_bytes: 1 << 20,
            clear_after_analysis: false,
            patterns: vec![Pattern::new("*.json").unwrap(), Pattern::new("*.json.zst").unwrap()],
        }
    }

    fn job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            url: format!("https://{}.test/", name),
            start_trace: StartTrigger::BeforeLoad,
            wait: WaitCondition::DelayMs(0),
        }
    }

    /// Writes one fixture trace per job.
    struct FixtureDriver {
        dir: PathBuf,
        batches_seen: usize,
        closed: usize,
    }

    impl Driver for FixtureDriver {
        async fn process_jobs(&mut self, jobs: &[Job]) -> Result<Vec<PathBuf>> {
            self.batches_seen += 1;
            let mut out = vec![];
            for job in jobs {
                let path = self.dir.join(format!("{}.json", job.name));
                tokio::fs::write(&path, trace_bytes()).await?;
                out.push(path);
            }
            Ok(out)
        }

        async fn close(&mut self) -> Result<()> {
            self.closed += 1;
            Ok(())
        }
    }

    async fn analysis_only(dir: &Path, store: AggregateStore) -> (RunSummary, AggregateStore) {
        let mut pipeline = Pipeline::create(vec![], IdleDriver, store, options(dir, Discovery::Directory))
            .await
            .unwrap();
        let summary = pipeline.run().await.unwrap();
        (summary, pipeline.into_store())
    }

    #[tokio::test]
    async fn test_two_traces_make_one_row() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), trace_bytes()).unwrap();
        std::fs::write(dir.path().join("b.json"), trace_bytes()).unwrap();

        let store = AggregateStore::open_in_memory().unwrap();
        let (summary, store) = analysis_only(dir.path(), store).await;

        assert_eq!(summary.batches, 1);
        assert_eq!(summary.traces_analyzed, 2);
        assert_eq!(store.row_count().unwrap(), 1);
        assert_eq!(store.num_calls(&source(), API).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_counts_accumulate_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db/analysis.db");
        let traces = dir.path().join("traces");
        std::fs::create_dir_all(&traces).unwrap();
        std::fs::write(traces.join("a.json"), trace_bytes()).unwrap();

        analysis_only(&traces, AggregateStore::open(&db).unwrap()).await;
        let (_, store) = analysis_only(&traces, AggregateStore::open(&db).unwrap()).await;

        assert_eq!(store.num_calls(&source(), API).unwrap(), Some(2));
        assert_eq!(store.list_batches(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_files_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), trace_bytes()).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let store = AggregateStore::open_in_memory().unwrap();
        let (summary, store) = analysis_only(dir.path(), store).await;

        assert_eq!(summary.traces_analyzed, 1);
        assert_eq!(summary.traces_skipped, 1);
        assert_eq!(store.num_calls(&source(), API).unwrap(), Some(1));

        let batch = &store.list_batches(1).unwrap()[0];
        let files = store.trace_files(batch.id).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].status, "corrupt");
        assert!(files[0].sha256.is_some());
        assert_eq!(files[1].status, "analyzed");
    }

    #[tokio::test]
    async fn test_oversized_trace_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        std::fs::write(&path, trace_bytes()).unwrap();

        let mut counter = ApiCounter::new();
        let record = analyze_file(&path, 16, &mut counter).await;
        assert_eq!(record.status, TraceStatus::Oversized);
        assert_eq!(record.sha256, None);
        assert!(counter.is_empty());

        let missing = analyze_file(&dir.path().join("gone.json"), 16, &mut counter).await;
        assert_eq!(missing.status, TraceStatus::Unreadable);
    }

    #[tokio::test]
    async fn test_decompressed_size_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bomb.json.zst");
        let plain = trace_bytes();
        let compressed = zstd::encode_all(&plain[..], 3).unwrap();
        std::fs::write(&path, &compressed).unwrap();

        // fits on disk, but not once decoded
        let limit = plain.len() as u64 - 1;
        assert!((compressed.len() as u64) < limit);

        let mut counter = ApiCounter::new();
        let record = analyze_file(&path, limit, &mut counter).await;
        assert_eq!(record.status, TraceStatus::Oversized);
        assert!(counter.is_empty());
    }

    #[test]
    fn test_rereads_only_for_uncleared_directory_batches() {
        let dir = Path::new("reports");
        let mut opts = options(dir, Discovery::Directory);
        assert!(!opts.rereads_traces(2));
        assert!(opts.rereads_traces(3));

        opts.clear_after_analysis = true;
        assert!(!opts.rereads_traces(3));

        assert!(!options(dir, Discovery::Batch).rereads_traces(3));
    }

    #[tokio::test]
    async fn test_compressed_traces_are_discovered_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let compressed = zstd::encode_all(&trace_bytes()[..], 3).unwrap();
        std::fs::write(dir.path().join("a.json.zst"), compressed).unwrap();

        let store = AggregateStore::open_in_memory().unwrap();
        let (summary, store) = analysis_only(dir.path(), store).await;
        assert_eq!(summary.traces_analyzed, 1);
        assert_eq!(store.num_calls(&source(), API).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_batches_only_see_their_own_traces() {
        let dir = tempfile::tempdir().unwrap();
        // left over from an earlier run; batch discovery must ignore it
        std::fs::write(dir.path().join("stale.json"), trace_bytes()).unwrap();

        let driver = FixtureDriver {
            dir: dir.path().to_path_buf(),
            batches_seen: 0,
            closed: 0,
        };
        let jobs = vec![job("a"), job("b"), job("c")];
        let store = AggregateStore::open_in_memory().unwrap();
        let mut pipeline = Pipeline::create(jobs, driver, store, options(dir.path(), Discovery::Batch))
            .await
            .unwrap();
        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.batches, 2);
        assert_eq!(summary.traces_analyzed, 3);
        assert_eq!(pipeline.driver.batches_seen, 2);
        assert_eq!(pipeline.driver.closed, 2);
        assert_eq!(pipeline.store().num_calls(&source(), API).unwrap(), Some(3));

        let batches = pipeline.store().list_batches(10).unwrap();
        assert_eq!(batches[0].batch_index, 1);
        assert_eq!(batches[0].job_count, 1);
        assert_eq!(batches[1].job_count, 2);
        assert_eq!(batches[0].run_id, pipeline.run_id().to_string());
    }

    #[tokio::test]
    async fn test_directory_discovery_includes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stale.json"), trace_bytes()).unwrap();

        let driver = FixtureDriver {
            dir: dir.path().to_path_buf(),
            batches_seen: 0,
            closed: 0,
        };
        let store = AggregateStore::open_in_memory().unwrap();
        let mut pipeline = Pipeline::create(
            vec![job("a")],
            driver,
            store,
            options(dir.path(), Discovery::Directory),
        )
        .await
        .unwrap();
        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.traces_analyzed, 2);
        assert_eq!(pipeline.store().num_calls(&source(), API).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_clear_removes_only_analyzed_traces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), trace_bytes()).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"[]").unwrap();

        let mut opts = options(dir.path(), Discovery::Directory);
        opts.clear_after_analysis = true;
        let store = AggregateStore::open_in_memory().unwrap();
        let mut pipeline = Pipeline::create(vec![], IdleDriver, store, opts).await.unwrap();
        pipeline.run().await.unwrap();

        assert!(!dir.path().join("good.json").exists());
        assert!(dir.path().join("broken.json").exists());
    }

    #[test]
    fn test_discover_traces_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.json", "a.json", "c.json.zst", "d.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.json")).unwrap();

        let opts = options(dir.path(), Discovery::Directory);
        let found = discover_traces(dir.path(), &opts.patterns).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json", "c.json.zst"]);
    }

    #[test]
    fn test_options_reject_bad_patterns() {
        let mut config = Config::default();
        config.reports.patterns = vec!["[".to_string()];
        assert!(PipelineOptions::from_config(&config).is_err());
    }
}
