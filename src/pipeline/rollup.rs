//! Thread-level rollup stage.
//!
//! Chunk summaries are grouped by conversation and rolled up into one
//! thread summary per conversation, windowing oversized threads through
//! [`rollup_windowed`]. Threads run under the bounded executor with
//! first-error cancellation: one failed thread stops the stage, and
//! in-flight siblings see the cancelled token.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use super::executor::{BoundedExecutor, ExecutorConfig, ExecutorError};
use super::index::{
    rebuild_thread_indices, IndexCounts, IndexLimits, SENTIMENT_SUMMARY_SUFFIX, SUMMARY_SUFFIX,
    THREAD_SENTIMENT_SUMMARY_SUFFIX, THREAD_SUMMARY_SUFFIX,
};
use super::summarize::GLOSSARY_FILE;
use super::{ItemError, PipelineError};
use crate::atomic::AtomicFileWriter;
use crate::glossary::Glossary;
use crate::provider::{ThreadRolluper, ThreadSentimentRolluper};
use crate::splitter::sanitize_filename_component;
use crate::types::{ChunkArtifact, ChunkSentimentSummary, ChunkSummary};
use crate::windower::{rollup_windowed, PartFiles};
use tokio_util::sync::CancellationToken;

/// Options of the rollup stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupOptions {
    /// Worker pool configuration.
    pub executor: ExecutorConfig,
    /// Chunk summaries per rollup call before windowing; 0 disables.
    pub max_chunks_per_thread: usize,
    /// Skip threads whose output already exists.
    pub resume: bool,
    /// Replace existing outputs.
    pub overwrite: bool,
    /// Indent output JSON.
    pub pretty: bool,
    /// Glossary file; defaults to `<input>/glossary.json`.
    pub glossary_path: Option<PathBuf>,
    /// Terms in the prompt excerpt; `None` includes all, `Some(0)` disables.
    pub glossary_max_terms: Option<usize>,
    /// Directory for thread sentiment summaries; `None` disables them.
    pub sentiment_out_dir: Option<PathBuf>,
    /// Rebuild the thread indices at the end of the run.
    pub reindex: bool,
    /// Limits applied to index records.
    pub index_limits: IndexLimits,
}

impl Default for RollupOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            max_chunks_per_thread: 5,
            resume: true,
            overwrite: false,
            pretty: false,
            glossary_path: None,
            glossary_max_terms: Some(60),
            sentiment_out_dir: None,
            reindex: true,
            index_limits: IndexLimits::default(),
        }
    }
}

/// Outcome of a rollup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupReport {
    /// Conversations found.
    pub threads: usize,
    /// Thread summaries written.
    pub written: usize,
    /// Thread summaries skipped by resume.
    pub skipped: usize,
    /// Thread sentiment summaries written.
    pub sentiment_written: usize,
    /// Rebuilt index counts, when reindexing.
    pub index: Option<IndexCounts>,
}

/// Semantic and sentiment chunk summary files under `input`, each sorted.
///
/// Thread-level summaries sitting in the same tree are ignored.
pub fn collect_summary_files(input: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), PipelineError> {
    let meta = fs::metadata(input)
        .map_err(|source| PipelineError::Io { path: input.to_path_buf(), source })?;
    if !meta.is_dir() {
        return Err(PipelineError::Io {
            path: input.to_path_buf(),
            source: std::io::Error::other("rollup input must be a directory of summaries"),
        });
    }

    let mut semantic = Vec::new();
    let mut sentiment = Vec::new();
    for entry in WalkDir::new(input) {
        let entry = entry.map_err(|e| PipelineError::Io {
            path: input.to_path_buf(),
            source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk loop detected")),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.ends_with(THREAD_SUMMARY_SUFFIX) || name.ends_with(THREAD_SENTIMENT_SUMMARY_SUFFIX) {
            continue;
        }
        if name.ends_with(SENTIMENT_SUMMARY_SUFFIX) {
            sentiment.push(entry.into_path());
        } else if name.ends_with(SUMMARY_SUFFIX) {
            semantic.push(entry.into_path());
        }
    }
    semantic.sort();
    sentiment.sort();
    Ok((semantic, sentiment))
}

/// Read summary files and group them by conversation id.
///
/// Each group is ordered by chunk number, then first turn. A file without
/// a conversation id is an error.
pub fn group_by_conversation<T: ChunkArtifact>(
    paths: &[PathBuf],
) -> Result<BTreeMap<String, Vec<T>>, PipelineError> {
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for path in paths {
        let item = || path.display().to_string();
        let data = fs::read(path).map_err(|source| PipelineError::Item {
            item: item(),
            source: ItemError::Read { path: path.clone(), source },
        })?;
        let summary: T = serde_json::from_slice(&data).map_err(|source| PipelineError::Item {
            item: item(),
            source: ItemError::Parse { path: path.clone(), source },
        })?;
        if summary.conversation_id().is_empty() {
            return Err(PipelineError::MissingConversationId { path: path.clone() });
        }
        groups.entry(summary.conversation_id().to_string()).or_default().push(summary);
    }
    for items in groups.values_mut() {
        items.sort_by_key(|s| s.order_key());
    }
    Ok(groups)
}

/// Roll up every conversation found under `input` into `out_dir`.
///
/// `sentiment` is only consulted when `opts.sentiment_out_dir` is set.
pub fn rollup_threads(
    input: &Path,
    out_dir: &Path,
    rolluper: &dyn ThreadRolluper,
    sentiment: Option<&dyn ThreadSentimentRolluper>,
    opts: &RollupOptions,
    cancel: &CancellationToken,
) -> Result<RollupReport, PipelineError> {
    let (semantic_files, sentiment_files) = collect_summary_files(input)?;
    let groups = group_by_conversation::<ChunkSummary>(&semantic_files)?;
    let sentiment_target = match (sentiment, opts.sentiment_out_dir.as_deref()) {
        (Some(rolluper), Some(dir)) => Some((rolluper, dir)),
        _ => None,
    };
    let sentiment_groups = if sentiment_target.is_some() {
        group_by_conversation::<ChunkSentimentSummary>(&sentiment_files)?
    } else {
        BTreeMap::new()
    };

    let glossary_path = opts.glossary_path.clone().unwrap_or_else(|| input.join(GLOSSARY_FILE));
    let glossary = Glossary::load(&glossary_path).unwrap_or_else(|error| {
        tracing::warn!(path = %glossary_path.display(), %error, "Glossary unreadable, rolling up without it");
        Glossary::new()
    });
    let excerpt = glossary.prompt_excerpt(opts.glossary_max_terms);

    let ids: Vec<&String> = groups.keys().collect();
    tracing::info!(
        input = %input.display(),
        out = %out_dir.display(),
        threads = ids.len(),
        sentiment = sentiment_target.is_some(),
        "Rolling up threads"
    );

    let executor = BoundedExecutor::new(opts.executor);
    let outcomes = executor
        .run_fail_fast(&ids, cancel, |id, token| {
            let id = id.as_str();
            let chunks = groups.get(id).map(Vec::as_slice).unwrap_or_default();
            let semantic = rollup_semantic(id, chunks, out_dir, rolluper, &excerpt, opts, token)?;

            let mut feeling = false;
            if let Some((sentiment, dir)) = sentiment_target {
                if let Some(chunks) = sentiment_groups.get(id).filter(|c| !c.is_empty()) {
                    feeling = rollup_sentiment(id, chunks, dir, sentiment, &excerpt, opts, token)?;
                }
            }
            Ok::<_, ItemError>((semantic, feeling))
        })
        .map_err(|e| match e {
            ExecutorError::Cancelled => PipelineError::Cancelled,
            ExecutorError::Item { index, source } => {
                tracing::error!(conversation_id = %ids[index], error = %source, "Thread rollup failed");
                PipelineError::Item { item: ids[index].clone(), source }
            }
        })?;

    let mut report = RollupReport { threads: ids.len(), ..RollupReport::default() };
    for (written, feeling) in outcomes {
        if written {
            report.written += 1;
        } else {
            report.skipped += 1;
        }
        if feeling {
            report.sentiment_written += 1;
        }
    }

    if opts.reindex {
        let sentiment_dir = sentiment_target.map(|(_, dir)| dir);
        report.index = Some(rebuild_thread_indices(out_dir, sentiment_dir, &opts.index_limits)?);
    }

    tracing::info!(
        written = report.written,
        skipped = report.skipped,
        sentiment_written = report.sentiment_written,
        "Rollup stage finished"
    );
    Ok(report)
}

/// Whether a thread output must be generated; errors on a conflict.
fn needs_output(path: &Path, opts: &RollupOptions) -> Result<bool, ItemError> {
    if opts.overwrite || !path.exists() {
        return Ok(true);
    }
    if !opts.resume {
        return Err(ItemError::OutputExists { path: path.to_path_buf() });
    }
    tracing::warn!(path = %path.display(), "Thread output exists, skipping");
    Ok(false)
}

fn write_output<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<(), ItemError> {
    AtomicFileWriter::new(true, pretty).write_json(path, value)?;
    Ok(())
}

fn rollup_semantic(
    id: &str,
    chunks: &[ChunkSummary],
    out_dir: &Path,
    rolluper: &dyn ThreadRolluper,
    excerpt: &str,
    opts: &RollupOptions,
    cancel: &CancellationToken,
) -> Result<bool, ItemError> {
    let stem = format!("{}.thread.summary", sanitize_filename_component(id));
    let out = out_dir.join(format!("{stem}.json"));
    if !needs_output(&out, opts)? {
        return Ok(false);
    }

    let parts = PartFiles::new(out_dir, stem)
        .with_resume(opts.resume)
        .with_overwrite(opts.overwrite)
        .with_pretty(opts.pretty);
    let summary = rollup_windowed(
        id,
        chunks,
        opts.max_chunks_per_thread,
        &parts,
        cancel,
        |window| rolluper.rollup(id, window, excerpt, cancel),
        |partials| rolluper.merge(id, partials, excerpt, cancel),
    )?;
    write_output(&out, &summary, opts.pretty)?;

    tracing::debug!(conversation_id = id, chunks = chunks.len(), path = %out.display(), "Wrote thread summary");
    Ok(true)
}

fn rollup_sentiment(
    id: &str,
    chunks: &[ChunkSentimentSummary],
    out_dir: &Path,
    rolluper: &dyn ThreadSentimentRolluper,
    excerpt: &str,
    opts: &RollupOptions,
    cancel: &CancellationToken,
) -> Result<bool, ItemError> {
    let stem = format!("{}.thread.sentiment.summary", sanitize_filename_component(id));
    let out = out_dir.join(format!("{stem}.json"));
    if !needs_output(&out, opts)? {
        return Ok(false);
    }

    let parts = PartFiles::new(out_dir, stem)
        .with_resume(opts.resume)
        .with_overwrite(opts.overwrite)
        .with_pretty(opts.pretty);
    let summary = rollup_windowed(
        id,
        chunks,
        opts.max_chunks_per_thread,
        &parts,
        cancel,
        |window| rolluper.rollup(id, window, excerpt, cancel),
        |partials| rolluper.merge(id, partials, excerpt, cancel),
    )?;
    write_output(&out, &summary, opts.pretty)?;

    tracing::debug!(conversation_id = id, chunks = chunks.len(), path = %out.display(), "Wrote thread sentiment summary");
    Ok(true)
}
