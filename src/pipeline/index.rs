//! JSONL retrieval indices over chunk and thread summaries.
//!
//! Indices are derived data: they are rebuilt from whatever summary files
//! are on disk and replaced atomically, one record per line.
//!
//! ## Files
//!
//! | Index | Source files | Location |
//! |-------|--------------|----------|
//! | `index.jsonl` | `*.summary.json` | chunk summaries dir |
//! | `sentiment_index.jsonl` | `*.sentiment.summary.json` | chunk summaries dir |
//! | `thread_index.jsonl` | `*.thread.summary.json` | thread summaries dir |
//! | `sentiment_thread_index.jsonl` | `*.thread.sentiment.summary.json` | thread sentiment dir |
//!
//! Chunk-level rebuilds skip summaries whose chunk or summary file cannot
//! be read, since a partially summarized tree is normal mid-run. Thread
//! rebuilds treat unreadable files as errors.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::atomic::{write_lines_atomic, AtomicWriteError};
use crate::types::{
    Chunk, ChunkSentimentSummary, ChunkSummary, ThreadSentimentSummary, ThreadSummary,
};

/// Chunk semantic index file name.
pub const CHUNK_INDEX_FILE: &str = "index.jsonl";
/// Chunk sentiment index file name.
pub const CHUNK_SENTIMENT_INDEX_FILE: &str = "sentiment_index.jsonl";
/// Thread semantic index file name.
pub const THREAD_INDEX_FILE: &str = "thread_index.jsonl";
/// Thread sentiment index file name.
pub const THREAD_SENTIMENT_INDEX_FILE: &str = "sentiment_thread_index.jsonl";

/// Suffix of chunk semantic summaries.
pub const SUMMARY_SUFFIX: &str = ".summary.json";
/// Suffix of chunk sentiment summaries.
pub const SENTIMENT_SUMMARY_SUFFIX: &str = ".sentiment.summary.json";
/// Suffix of thread semantic summaries.
pub const THREAD_SUMMARY_SUFFIX: &str = ".thread.summary.json";
/// Suffix of thread sentiment summaries.
pub const THREAD_SENTIMENT_SUMMARY_SUFFIX: &str = ".thread.sentiment.summary.json";

/// Error type for index rebuilds.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Walking a summaries directory failed.
    #[error("Failed to walk {}: {source}", path.display())]
    Walk {
        /// Directory walked.
        path: PathBuf,
        /// Walker error.
        #[source]
        source: walkdir::Error,
    },
    /// A thread summary could not be read.
    #[error("Failed to read summary {}: {source}", path.display())]
    Read {
        /// Summary file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A thread summary is not valid JSON of the expected shape.
    #[error("Failed to parse summary {}: {source}", path.display())]
    Parse {
        /// Summary file.
        path: PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// A record could not be encoded.
    #[error("Failed to encode index record: {0}")]
    Encode(#[source] serde_json::Error),
    /// Writing an index file failed.
    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

/// Size limits applied to index records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLimits {
    /// Maximum summary characters; 0 keeps the full text.
    pub summary_max_chars: usize,
    /// Maximum tags (and themes); 0 keeps all.
    pub tags_max: usize,
    /// Maximum terms (and emotion labels on thread records); 0 keeps all.
    pub terms_max: usize,
}

impl Default for IndexLimits {
    fn default() -> Self {
        Self { summary_max_chars: 600, tags_max: 5, terms_max: 15 }
    }
}

/// Record counts of one rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCounts {
    /// Semantic records written.
    pub semantic: usize,
    /// Sentiment records written.
    pub sentiment: usize,
}

/// One line of `index.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Conversation id.
    pub conversation_id: String,
    /// Thread start.
    #[serde(rename = "thread_start_time", default, skip_serializing_if = "Option::is_none")]
    pub thread_start: Option<f64>,
    /// 1-based chunk number.
    pub chunk_number: usize,
    /// First turn (inclusive).
    pub turn_start: usize,
    /// Last turn (exclusive).
    pub turn_end: usize,
    /// Chunk file.
    pub chunk_path: String,
    /// Summary file.
    pub summary_path: String,
    /// Truncated summary.
    pub summary: String,
    /// Deduplicated, limited tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Deduplicated, limited terms.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
}

impl IndexRecord {
    /// Build a record from a chunk and its summary.
    pub fn build(
        chunk: &Chunk,
        chunk_path: &Path,
        summary: &ChunkSummary,
        summary_path: &Path,
        limits: &IndexLimits,
    ) -> Self {
        Self {
            conversation_id: chunk.conversation_id.clone(),
            thread_start: chunk.thread_start,
            chunk_number: chunk.chunk_number,
            turn_start: chunk.turn_start,
            turn_end: chunk.turn_end,
            chunk_path: chunk_path.display().to_string(),
            summary_path: summary_path.display().to_string(),
            summary: truncate_chars(&summary.summary, limits.summary_max_chars),
            tags: limit_strings(dedupe_strings(&summary.tags), limits.tags_max),
            terms: limit_strings(dedupe_strings(&summary.terms), limits.terms_max),
        }
    }
}

/// One line of `sentiment_index.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentIndexRecord {
    /// Conversation id.
    pub conversation_id: String,
    /// Thread start.
    #[serde(rename = "thread_start_time", default, skip_serializing_if = "Option::is_none")]
    pub thread_start: Option<f64>,
    /// 1-based chunk number.
    pub chunk_number: usize,
    /// First turn (inclusive).
    pub turn_start: usize,
    /// Last turn (exclusive).
    pub turn_end: usize,
    /// Chunk file.
    pub chunk_path: String,
    /// Sentiment summary file.
    pub sentiment_summary_path: String,
    /// Truncated emotional summary.
    pub emotional_summary: String,
    /// Dominant emotions, limited like tags.
    pub dominant_emotions: Vec<String>,
    /// Remembered emotions.
    pub remembered_emotions: Vec<String>,
    /// Present emotions.
    pub present_emotions: Vec<String>,
    /// Emotional tensions.
    pub emotional_tensions: Vec<String>,
    /// Emotional arc.
    pub emotional_arc: String,
    /// Themes, limited like tags.
    pub themes: Vec<String>,
    /// Symbols or metaphors.
    pub symbols_or_metaphors: Vec<String>,
    /// Relational shift.
    pub relational_shift: String,
    /// Resonance notes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resonance_notes: String,
    /// Tone markers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tone_markers: Vec<String>,
}

impl SentimentIndexRecord {
    /// Build a record from a chunk and its sentiment summary.
    pub fn build(
        chunk: &Chunk,
        chunk_path: &Path,
        summary: &ChunkSentimentSummary,
        summary_path: &Path,
        limits: &IndexLimits,
    ) -> Self {
        Self {
            conversation_id: chunk.conversation_id.clone(),
            thread_start: chunk.thread_start,
            chunk_number: chunk.chunk_number,
            turn_start: chunk.turn_start,
            turn_end: chunk.turn_end,
            chunk_path: chunk_path.display().to_string(),
            sentiment_summary_path: summary_path.display().to_string(),
            emotional_summary: truncate_chars(&summary.emotional_summary, limits.summary_max_chars),
            dominant_emotions: limit_strings(dedupe_strings(&summary.dominant_emotions), limits.tags_max),
            remembered_emotions: dedupe_strings(&summary.remembered_emotions),
            present_emotions: dedupe_strings(&summary.present_emotions),
            emotional_tensions: dedupe_strings(&summary.emotional_tensions),
            emotional_arc: summary.emotional_arc.trim().to_string(),
            themes: limit_strings(dedupe_strings(&summary.themes), limits.tags_max),
            symbols_or_metaphors: dedupe_strings(&summary.symbols_or_metaphors),
            relational_shift: summary.relational_shift.trim().to_string(),
            resonance_notes: summary.resonance_notes.trim().to_string(),
            tone_markers: dedupe_strings(&summary.tone_markers),
        }
    }
}

/// One line of `thread_index.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadIndexRecord {
    /// Conversation id.
    pub conversation_id: String,
    /// Thread start.
    #[serde(rename = "thread_start_time", default, skip_serializing_if = "Option::is_none")]
    pub thread_start: Option<f64>,
    /// Thread title.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Thread summary file.
    pub thread_summary_path: String,
    /// Truncated summary.
    pub summary: String,
    /// Deduplicated, limited tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Deduplicated, limited terms.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
}

impl ThreadIndexRecord {
    /// Build a record from a thread summary.
    pub fn build(summary: &ThreadSummary, path: &Path, limits: &IndexLimits) -> Self {
        Self {
            conversation_id: summary.conversation_id.clone(),
            thread_start: summary.thread_start,
            title: summary.title.trim().to_string(),
            thread_summary_path: path.display().to_string(),
            summary: truncate_chars(&summary.summary, limits.summary_max_chars),
            tags: limit_strings(dedupe_strings(&summary.tags), limits.tags_max),
            terms: limit_strings(dedupe_strings(&summary.terms), limits.terms_max),
        }
    }
}

/// One line of `sentiment_thread_index.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSentimentIndexRecord {
    /// Conversation id.
    pub conversation_id: String,
    /// Thread start.
    #[serde(rename = "thread_start_time", default, skip_serializing_if = "Option::is_none")]
    pub thread_start: Option<f64>,
    /// Thread title.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Thread sentiment summary file.
    pub thread_sentiment_summary_path: String,
    /// Truncated emotional summary.
    pub emotional_summary: String,
    /// Dominant emotions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dominant_emotions: Vec<String>,
    /// Remembered emotions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remembered_emotions: Vec<String>,
    /// Present emotions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub present_emotions: Vec<String>,
    /// Emotional tensions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emotional_tensions: Vec<String>,
    /// Relational shift.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relational_shift: String,
    /// Emotional arc.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub emotional_arc: String,
    /// Themes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub themes: Vec<String>,
}

impl ThreadSentimentIndexRecord {
    /// Build a record from a thread sentiment summary.
    pub fn build(summary: &ThreadSentimentSummary, path: &Path, limits: &IndexLimits) -> Self {
        let emotions = |list: &[String]| limit_strings(dedupe_strings(list), limits.terms_max);
        Self {
            conversation_id: summary.conversation_id.clone(),
            thread_start: summary.thread_start,
            title: summary.title.trim().to_string(),
            thread_sentiment_summary_path: path.display().to_string(),
            emotional_summary: truncate_chars(&summary.emotional_summary, limits.summary_max_chars),
            dominant_emotions: emotions(&summary.dominant_emotions),
            remembered_emotions: emotions(&summary.remembered_emotions),
            present_emotions: emotions(&summary.present_emotions),
            emotional_tensions: emotions(&summary.emotional_tensions),
            relational_shift: summary.relational_shift.trim().to_string(),
            emotional_arc: summary.emotional_arc.trim().to_string(),
            themes: limit_strings(dedupe_strings(&summary.themes), limits.tags_max),
        }
    }
}

/// Trim, drop empties and deduplicate case-insensitively, keeping the
/// first spelling seen.
pub fn dedupe_strings(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && seen.insert(v.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Keep at most `max` values; 0 keeps all.
pub fn limit_strings(mut values: Vec<String>, max: usize) -> Vec<String> {
    if max > 0 {
        values.truncate(max);
    }
    values
}

/// Trim `s` and cut it to `max` characters, appending `…` when cut.
///
/// Counts characters, never splitting a code point; 0 keeps the full text.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let s = s.trim();
    if max == 0 {
        return s.to_string();
    }
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

/// Rebuild `index.jsonl` and `sentiment_index.jsonl` in `summaries_dir`.
///
/// Each summary's chunk is found by mirroring its relative path under
/// `chunks_root` with the summary suffix replaced by `.json`. Identity
/// fields come from the chunk file, not the summary.
pub fn rebuild_chunk_indices(
    chunks_root: &Path,
    summaries_dir: &Path,
    limits: &IndexLimits,
) -> Result<IndexCounts, IndexError> {
    let mut semantic = Vec::new();
    let mut sentiment = Vec::new();

    for path in walk_files(summaries_dir)? {
        let name = file_name_lower(&path);
        if name.ends_with(SENTIMENT_SUMMARY_SUFFIX) {
            sentiment.push(path);
        } else if name.ends_with(SUMMARY_SUFFIX) {
            semantic.push(path);
        }
    }

    let mut lines = Vec::with_capacity(semantic.len());
    for summary_path in &semantic {
        let chunk_path = chunk_path_for(chunks_root, summaries_dir, summary_path, SUMMARY_SUFFIX);
        let Some((chunk, summary)) = read_pair::<ChunkSummary>(&chunk_path, summary_path) else {
            continue;
        };
        let record = IndexRecord::build(&chunk, &chunk_path, &summary, summary_path, limits);
        lines.push(serde_json::to_string(&record).map_err(IndexError::Encode)?);
    }
    let semantic_count = lines.len();
    write_lines_atomic(&summaries_dir.join(CHUNK_INDEX_FILE), &lines)?;

    let mut lines = Vec::with_capacity(sentiment.len());
    for summary_path in &sentiment {
        let chunk_path =
            chunk_path_for(chunks_root, summaries_dir, summary_path, SENTIMENT_SUMMARY_SUFFIX);
        let Some((chunk, summary)) = read_pair::<ChunkSentimentSummary>(&chunk_path, summary_path)
        else {
            continue;
        };
        let record = SentimentIndexRecord::build(&chunk, &chunk_path, &summary, summary_path, limits);
        lines.push(serde_json::to_string(&record).map_err(IndexError::Encode)?);
    }
    let sentiment_count = lines.len();
    write_lines_atomic(&summaries_dir.join(CHUNK_SENTIMENT_INDEX_FILE), &lines)?;

    tracing::info!(
        dir = %summaries_dir.display(),
        semantic = semantic_count,
        sentiment = sentiment_count,
        "Rebuilt chunk indices"
    );
    Ok(IndexCounts { semantic: semantic_count, sentiment: sentiment_count })
}

/// Rebuild `thread_index.jsonl` in `thread_dir` and, when given,
/// `sentiment_thread_index.jsonl` in `sentiment_dir`.
///
/// Summaries with an empty conversation id are skipped.
pub fn rebuild_thread_indices(
    thread_dir: &Path,
    sentiment_dir: Option<&Path>,
    limits: &IndexLimits,
) -> Result<IndexCounts, IndexError> {
    let mut lines = Vec::new();
    for path in walk_files(thread_dir)? {
        if !file_name_lower(&path).ends_with(THREAD_SUMMARY_SUFFIX) {
            continue;
        }
        let summary: ThreadSummary = read_json(&path)?;
        if summary.conversation_id.trim().is_empty() {
            continue;
        }
        let record = ThreadIndexRecord::build(&summary, &path, limits);
        lines.push(serde_json::to_string(&record).map_err(IndexError::Encode)?);
    }
    let semantic = lines.len();
    write_lines_atomic(&thread_dir.join(THREAD_INDEX_FILE), &lines)?;

    let mut sentiment = 0;
    if let Some(dir) = sentiment_dir {
        let mut lines = Vec::new();
        for path in walk_files(dir)? {
            if !file_name_lower(&path).ends_with(THREAD_SENTIMENT_SUMMARY_SUFFIX) {
                continue;
            }
            let summary: ThreadSentimentSummary = read_json(&path)?;
            if summary.conversation_id.trim().is_empty() {
                continue;
            }
            let record = ThreadSentimentIndexRecord::build(&summary, &path, limits);
            lines.push(serde_json::to_string(&record).map_err(IndexError::Encode)?);
        }
        sentiment = lines.len();
        write_lines_atomic(&dir.join(THREAD_SENTIMENT_INDEX_FILE), &lines)?;
    }

    tracing::info!(dir = %thread_dir.display(), semantic, sentiment, "Rebuilt thread indices");
    Ok(IndexCounts { semantic, sentiment })
}

/// Regular files under `root`, sorted by path. A missing root is empty.
fn walk_files(root: &Path) -> Result<Vec<PathBuf>, IndexError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| IndexError::Walk { path: root.to_path_buf(), source })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn file_name_lower(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default()
}

/// Mirror `summary_path` from `summaries_dir` into `chunks_root`.
fn chunk_path_for(chunks_root: &Path, summaries_dir: &Path, summary_path: &Path, suffix: &str) -> PathBuf {
    let rel = summary_path.strip_prefix(summaries_dir).unwrap_or(summary_path);
    let rel = rel.to_string_lossy();
    let stem = &rel[..rel.len().saturating_sub(suffix.len())];
    chunks_root.join(format!("{stem}.json"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, IndexError> {
    let data = fs::read(path).map_err(|source| IndexError::Read { path: path.to_path_buf(), source })?;
    serde_json::from_slice(&data).map_err(|source| IndexError::Parse { path: path.to_path_buf(), source })
}

fn read_pair<S: DeserializeOwned>(chunk_path: &Path, summary_path: &Path) -> Option<(Chunk, S)> {
    let chunk: Chunk = match read_json(chunk_path) {
        Ok(chunk) => chunk,
        Err(error) => {
            tracing::debug!(chunk = %chunk_path.display(), %error, "Skipping summary without readable chunk");
            return None;
        }
    };
    match read_json(summary_path) {
        Ok(summary) => Some((chunk, summary)),
        Err(error) => {
            tracing::debug!(summary = %summary_path.display(), %error, "Skipping unreadable summary");
            None
        }
    }
}
