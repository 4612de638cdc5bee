//! Chunk-level summarize stage.
//!
//! Chunk files are summarized in batches under the bounded executor with
//! aggregated errors: a failing chunk never stops its siblings, and every
//! failure of a batch is reported once the batch has joined. Successful
//! items still contribute their glossary additions before the failures
//! are returned, so a rerun with resume picks up where this one stopped.
//!
//! ## Outputs
//!
//! For a chunk at `<input>/<rel>.json`:
//!
//! - `<out>/<rel>.summary.json` (semantic)
//! - `<out>/<rel>.sentiment.summary.json` (sentiment)
//! - `<out>/glossary.json` unless another glossary path is configured
//! - `<out>/index.jsonl` and `<out>/sentiment_index.jsonl` when reindexing

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::executor::{BoundedExecutor, ExecutorConfig};
use super::index::{
    rebuild_chunk_indices, IndexCounts, IndexLimits, SENTIMENT_SUMMARY_SUFFIX, SUMMARY_SUFFIX,
};
use super::{ItemError, ItemFailureReport, PipelineError};
use crate::atomic::AtomicFileWriter;
use tokio_util::sync::CancellationToken;
use crate::glossary::Glossary;
use crate::provider::{ChunkSentimentSummarizer, ChunkSummarizer};
use crate::types::{Chunk, ChunkSentimentSummary, ChunkSummary, GlossaryAddition};

/// Directory names never descended into when collecting chunk files.
const SKIPPED_DIRS: [&str; 3] = ["summaries", "summary", "index"];

/// Default glossary file name inside the output directory.
pub const GLOSSARY_FILE: &str = "glossary.json";

/// Options of the summarize stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeOptions {
    /// Worker pool configuration.
    pub executor: ExecutorConfig,
    /// Chunks per batch; 0 runs everything as one batch.
    pub batch_size: usize,
    /// Only process the first `n` chunk files.
    pub max_chunks: Option<usize>,
    /// Skip chunks whose two outputs already exist.
    pub resume: bool,
    /// Replace existing outputs.
    pub overwrite: bool,
    /// Indent output JSON.
    pub pretty: bool,
    /// Glossary file; defaults to `<out>/glossary.json`.
    pub glossary_path: Option<PathBuf>,
    /// Terms in the prompt excerpt; `None` includes all, `Some(0)` disables.
    pub glossary_max_terms: Option<usize>,
    /// Cull entries seen fewer times at the end of the run (when > 1).
    pub glossary_min_count: u64,
    /// Rebuild the chunk indices at the end of the run.
    pub reindex: bool,
    /// Limits applied to index records.
    pub index_limits: IndexLimits,
}

impl Default for SummarizeOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            batch_size: 25,
            max_chunks: None,
            resume: true,
            overwrite: false,
            pretty: false,
            glossary_path: None,
            glossary_max_terms: Some(60),
            glossary_min_count: 2,
            reindex: true,
            index_limits: IndexLimits::default(),
        }
    }
}

/// Outcome of a summarize run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummarizeReport {
    /// Chunk files considered.
    pub total: usize,
    /// Chunks skipped by resume.
    pub skipped: usize,
    /// Chunks summarized in this run.
    pub summarized: usize,
    /// Glossary entries after the final cull.
    pub glossary_terms: usize,
    /// Rebuilt index counts, when reindexing.
    pub index: Option<IndexCounts>,
}

/// One chunk file and its two output paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryJob {
    /// Chunk file.
    pub chunk_path: PathBuf,
    /// Semantic summary output.
    pub summary_path: PathBuf,
    /// Sentiment summary output.
    pub sentiment_path: PathBuf,
}

impl SummaryJob {
    /// Derive output paths for `chunk_path`, mirroring its position under
    /// `input_root` into `out_dir`.
    pub fn new(input_root: &Path, out_dir: &Path, chunk_path: &Path) -> Self {
        let rel = if input_root.is_dir() {
            chunk_path.strip_prefix(input_root).unwrap_or(chunk_path)
        } else {
            chunk_path.file_name().map(Path::new).unwrap_or(chunk_path)
        };
        let stem = out_dir.join(rel.with_extension(""));
        Self {
            chunk_path: chunk_path.to_path_buf(),
            summary_path: with_suffix(&stem, SUMMARY_SUFFIX),
            sentiment_path: with_suffix(&stem, SENTIMENT_SUMMARY_SUFFIX),
        }
    }

    fn is_done(&self) -> bool {
        self.summary_path.exists() && self.sentiment_path.exists()
    }
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(stem.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Chunk files under `input`, sorted.
///
/// A single file is returned as-is. Directories are walked recursively,
/// skipping `summaries`, `summary` and `index` subdirectories and any
/// `*.summary.json` file.
pub fn collect_chunk_files(input: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let meta = fs::metadata(input)
        .map_err(|source| PipelineError::Io { path: input.to_path_buf(), source })?;
    if !meta.is_dir() {
        return Ok(vec![input.to_path_buf()]);
    }

    let walker = WalkDir::new(input).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry.file_type().is_dir()
            || !SKIPPED_DIRS.contains(&entry.file_name().to_string_lossy().to_lowercase().as_str())
    });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| PipelineError::Io {
            path: input.to_path_buf(),
            source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk loop detected")),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.ends_with(".json") && !name.ends_with(SUMMARY_SUFFIX) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Summarize every chunk file under `input` into `out_dir`.
pub fn summarize_chunks(
    input: &Path,
    out_dir: &Path,
    summarizer: &dyn ChunkSummarizer,
    sentiment: &dyn ChunkSentimentSummarizer,
    opts: &SummarizeOptions,
    cancel: &CancellationToken,
) -> Result<SummarizeReport, PipelineError> {
    let mut files = collect_chunk_files(input)?;
    if let Some(max) = opts.max_chunks {
        files.truncate(max);
    }

    let glossary_path = opts.glossary_path.clone().unwrap_or_else(|| out_dir.join(GLOSSARY_FILE));
    let mut glossary = Glossary::load(&glossary_path)?;
    let mut report = SummarizeReport { total: files.len(), ..SummarizeReport::default() };

    let mut pending = Vec::with_capacity(files.len());
    for path in &files {
        let job = SummaryJob::new(input, out_dir, path);
        if opts.resume && job.is_done() {
            report.skipped += 1;
            continue;
        }
        pending.push(job);
    }

    tracing::info!(
        input = %input.display(),
        out = %out_dir.display(),
        total = report.total,
        pending = pending.len(),
        skipped = report.skipped,
        glossary_terms = glossary.len(),
        "Summarizing chunks"
    );

    let executor = BoundedExecutor::new(opts.executor);
    let writer = AtomicFileWriter::new(opts.overwrite, opts.pretty);
    let batch_size = if opts.batch_size == 0 { pending.len().max(1) } else { opts.batch_size };

    for (batch_no, batch) in pending.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let excerpt = glossary.prompt_excerpt(opts.glossary_max_terms);

        let outcome = executor.run_collect(batch, cancel, |job, token| {
            summarize_one(job, &excerpt, summarizer, sentiment, &writer, opts.resume, token)
        });

        for (_, learned) in &outcome.results {
            glossary.merge(&learned.additions, learned.seen_at);
        }
        glossary.save(&glossary_path)?;
        report.summarized += outcome.results.len();

        tracing::info!(
            batch = batch_no + 1,
            ok = outcome.results.len(),
            failed = outcome.failures.len(),
            glossary_terms = glossary.len(),
            "Summarize batch finished"
        );

        if !outcome.failures.is_empty() {
            let failures: Vec<ItemFailureReport> = outcome
                .failures
                .into_iter()
                .map(|f| ItemFailureReport {
                    item: batch[f.index].chunk_path.display().to_string(),
                    error: f.error,
                })
                .collect();
            for failure in &failures {
                tracing::warn!(chunk = %failure.item, error = %failure.error, "Chunk summary failed");
            }
            return Err(PipelineError::Aggregate { failures });
        }
        if !outcome.not_started.is_empty() {
            return Err(PipelineError::Cancelled);
        }
    }

    if opts.glossary_min_count > 1 {
        let removed = glossary.cull(opts.glossary_min_count);
        tracing::debug!(removed, min_count = opts.glossary_min_count, "Culled glossary");
    }
    glossary.save(&glossary_path)?;
    report.glossary_terms = glossary.len();

    if opts.reindex {
        report.index = Some(rebuild_chunk_indices(input, out_dir, &opts.index_limits)?);
    }

    tracing::info!(
        summarized = report.summarized,
        skipped = report.skipped,
        glossary_terms = report.glossary_terms,
        "Summarize stage finished"
    );
    Ok(report)
}

/// Glossary input produced by one summarized chunk.
#[derive(Debug)]
struct Learned {
    additions: Vec<GlossaryAddition>,
    seen_at: Option<f64>,
}

fn summarize_one(
    job: &SummaryJob,
    excerpt: &str,
    summarizer: &dyn ChunkSummarizer,
    sentiment: &dyn ChunkSentimentSummarizer,
    writer: &AtomicFileWriter,
    resume: bool,
    cancel: &CancellationToken,
) -> Result<Learned, ItemError> {
    let path = &job.chunk_path;
    let data = fs::read(path).map_err(|source| ItemError::Read { path: path.clone(), source })?;
    let chunk: Chunk =
        serde_json::from_slice(&data).map_err(|source| ItemError::Parse { path: path.clone(), source })?;
    if !chunk.has_identity() {
        return Err(ItemError::MissingIdentity { path: path.clone() });
    }

    if cancel.is_cancelled() {
        return Err(ItemError::Cancelled);
    }
    let draft = summarizer
        .summarize(&chunk, excerpt, cancel)
        .map_err(|source| ItemError::Summarize { path: path.clone(), source })?;
    if cancel.is_cancelled() {
        return Err(ItemError::Cancelled);
    }
    let feeling = sentiment
        .summarize_sentiment(&chunk, excerpt, cancel)
        .map_err(|source| ItemError::Sentiment { path: path.clone(), source })?;

    let mut additions = draft.glossary_additions.clone();
    additions.extend(draft.terms.iter().map(|t| GlossaryAddition::bare(t.as_str())));

    let summary = ChunkSummary::from_draft(&chunk, draft);
    let sentiment_summary = ChunkSentimentSummary::from_draft(&chunk, feeling);
    write_tolerant(writer, &job.summary_path, &summary, resume)?;
    write_tolerant(writer, &job.sentiment_path, &sentiment_summary, resume)?;

    tracing::debug!(
        conversation_id = %chunk.conversation_id,
        chunk_number = chunk.chunk_number,
        path = %path.display(),
        "Summarized chunk"
    );
    Ok(Learned { additions, seen_at: chunk.thread_start })
}

/// Write `value`, treating an existing file as done under resume.
fn write_tolerant<T: serde::Serialize>(
    writer: &AtomicFileWriter,
    path: &Path,
    value: &T,
    resume: bool,
) -> Result<(), ItemError> {
    match writer.write_json(path, value) {
        Ok(_) => Ok(()),
        Err(e) if resume && e.is_already_exists() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::types::{ChunkSentimentDraft, ChunkSummaryDraft, SimplifiedMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl Echo {
        fn new(fail_on: Option<usize>) -> Self {
            Self { calls: AtomicUsize::new(0), fail_on }
        }
    }

    impl ChunkSummarizer for Echo {
        fn summarize(
            &self,
            chunk: &Chunk,
            _excerpt: &str,
            _cancel: &CancellationToken,
        ) -> Result<ChunkSummaryDraft, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(chunk.chunk_number) {
                return Err(ProviderError::new("model refused"));
            }
            Ok(ChunkSummaryDraft {
                summary: format!("chunk {}", chunk.chunk_number),
                terms: vec!["Kernel".into()],
                glossary_additions: vec![GlossaryAddition {
                    term: "kernel".into(),
                    definition: "core loop".into(),
                }],
                ..ChunkSummaryDraft::default()
            })
        }
    }

    impl ChunkSentimentSummarizer for Echo {
        fn summarize_sentiment(
            &self,
            _chunk: &Chunk,
            _excerpt: &str,
            _cancel: &CancellationToken,
        ) -> Result<ChunkSentimentDraft, ProviderError> {
            Ok(ChunkSentimentDraft { emotional_summary: "steady".into(), ..Default::default() })
        }
    }

    fn write_chunk(dir: &Path, n: usize) -> PathBuf {
        let chunk = Chunk {
            conversation_id: "c1".into(),
            title: String::new(),
            thread_start: Some(1_700_000_000.0),
            chunk_number: n,
            turn_start: n - 1,
            turn_end: n,
            messages: vec![SimplifiedMessage::new("user", "hi")],
        };
        let path = dir.join(format!("t/1700000000_{n}.json"));
        AtomicFileWriter::new(true, false).write_json(&path, &chunk).unwrap();
        path
    }

    #[test]
    fn test_collect_skips_summary_dirs_and_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_chunk(tmp.path(), 1);
        fs::create_dir_all(tmp.path().join("summaries")).unwrap();
        fs::write(tmp.path().join("summaries/x.json"), "{}").unwrap();
        fs::write(tmp.path().join("t/a.summary.json"), "{}").unwrap();
        fs::write(tmp.path().join("t/notes.txt"), "").unwrap();

        let files = collect_chunk_files(tmp.path()).unwrap();
        assert_eq!(files, vec![tmp.path().join("t/1700000000_1.json")]);
    }

    #[test]
    fn test_job_paths_mirror_input() {
        let tmp = tempfile::tempdir().unwrap();
        let chunk = write_chunk(tmp.path(), 3);
        let job = SummaryJob::new(tmp.path(), Path::new("/out"), &chunk);

        assert_eq!(job.summary_path, Path::new("/out/t/1700000000_3.summary.json"));
        assert_eq!(job.sentiment_path, Path::new("/out/t/1700000000_3.sentiment.summary.json"));
    }

    #[test]
    fn test_summarize_writes_outputs_and_glossary() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("chunks");
        let out = tmp.path().join("summaries");
        for n in 1..=3 {
            write_chunk(&input, n);
        }
        let echo = Echo::new(None);
        let opts = SummarizeOptions { batch_size: 2, glossary_min_count: 0, ..SummarizeOptions::default() };

        let report = summarize_chunks(&input, &out, &echo, &echo, &opts, &CancellationToken::new()).unwrap();

        assert_eq!(report.summarized, 3);
        assert_eq!(report.index, Some(IndexCounts { semantic: 3, sentiment: 3 }));
        let summary: ChunkSummary =
            serde_json::from_slice(&fs::read(out.join("t/1700000000_2.summary.json")).unwrap()).unwrap();
        assert_eq!(summary.conversation_id, "c1");
        assert_eq!(summary.chunk_number, 2);

        let glossary = Glossary::load(&out.join(GLOSSARY_FILE)).unwrap();
        let entry = glossary.get("kernel").unwrap();
        assert_eq!(entry.count, 3);
        assert_eq!(entry.definition, "core loop");
    }

    #[test]
    fn test_resume_skips_finished_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("chunks");
        let out = tmp.path().join("summaries");
        write_chunk(&input, 1);
        let opts = SummarizeOptions { reindex: false, ..SummarizeOptions::default() };

        let first = Echo::new(None);
        summarize_chunks(&input, &out, &first, &first, &opts, &CancellationToken::new()).unwrap();
        let second = Echo::new(None);
        let report = summarize_chunks(&input, &out, &second, &second, &opts, &CancellationToken::new()).unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failures_are_aggregated_after_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("chunks");
        let out = tmp.path().join("summaries");
        for n in 1..=4 {
            write_chunk(&input, n);
        }
        let echo = Echo::new(Some(2));
        let opts = SummarizeOptions { batch_size: 0, glossary_min_count: 0, ..SummarizeOptions::default() };

        let err = summarize_chunks(&input, &out, &echo, &echo, &opts, &CancellationToken::new()).unwrap_err();

        let PipelineError::Aggregate { failures } = err else { panic!("expected aggregate error") };
        assert_eq!(failures.len(), 1);
        assert!(failures[0].item.ends_with("1700000000_2.json"));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 4);
        assert!(out.join("t/1700000000_4.summary.json").exists());
        // Successful siblings still fed the glossary.
        let glossary = Glossary::load(&out.join(GLOSSARY_FILE)).unwrap();
        assert_eq!(glossary.get("kernel").map(|e| e.count), Some(3));
    }

    #[test]
    fn test_chunk_without_identity_fails_item() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("chunks");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("bad.json"), r#"{"messages":[]}"#).unwrap();
        let echo = Echo::new(None);

        let err = summarize_chunks(
            &input,
            &tmp.path().join("out"),
            &echo,
            &echo,
            &SummarizeOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();

        let PipelineError::Aggregate { failures } = err else { panic!("expected aggregate error") };
        assert!(matches!(failures[0].error, ItemError::MissingIdentity { .. }));
    }
}
