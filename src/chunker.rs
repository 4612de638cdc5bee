//! Chunk breakpoint application and the thread chunking driver.
//!
//! Breakpoints are turn indices. They come from an injected
//! [`BreakpointDecider`] or, when it returns nothing, from a fixed stride.
//! Either way they are normalized before use (see [`BreakpointSet`]), so
//! unsorted, duplicated or out-of-range values never fail a thread: they
//! are dropped and logged at debug level.
//!
//! ## Guarantees
//!
//! - chunk turn ranges cover `[0, total_turns)` exactly once
//! - `chunk_number` is the 1-based position in the emitted sequence
//! - `turn_end` is exclusive
//! - every chunk owns a copy of its messages

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::atomic::{AtomicFileWriter, AtomicWriteError};
use tokio_util::sync::CancellationToken;
use crate::provider::{BreakpointDecider, ProviderError};
use crate::segmenter::build_turns;
use crate::types::{BreakpointSet, Chunk, SimplifiedConversation, Turn};

/// File stem used when a thread has no usable start time.
const UNTIMED_STEM: &str = "thread";

/// Error type for chunking.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The target chunk size is zero.
    #[error("Target turns per chunk must be > 0")]
    InvalidTarget,
    /// The input path is neither a directory nor a `.json` file.
    #[error("Input must be a directory or a .json file: {}", path.display())]
    InvalidInput {
        /// Input path.
        path: PathBuf,
    },
    /// Listing the input failed.
    #[error("Failed to list thread files in {}: {source}", path.display())]
    ListInput {
        /// Input path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A thread file could not be read.
    #[error("Failed to read thread {}: {source}", path.display())]
    ReadThread {
        /// Thread file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A thread file is not a simplified conversation.
    #[error("Failed to parse thread {}: {source}", path.display())]
    ParseThread {
        /// Thread file.
        path: PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// The thread has no messages, hence no turns.
    #[error("Thread has no messages/turns: {}", path.display())]
    NoTurns {
        /// Thread file.
        path: PathBuf,
    },
    /// The breakpoint decider failed.
    #[error("Failed to decide breakpoints for {conversation_id}: {source}")]
    Decide {
        /// Conversation id.
        conversation_id: String,
        /// Decider failure.
        #[source]
        source: ProviderError,
    },
    /// A turn range maps to messages outside the thread.
    #[error(
        "Invalid message range for {conversation_id} turns [{turn_start},{turn_end}): {msg_start}..{msg_end}"
    )]
    InvalidMessageRange {
        /// Conversation id.
        conversation_id: String,
        /// First turn (inclusive).
        turn_start: usize,
        /// Last turn (exclusive).
        turn_end: usize,
        /// First message (inclusive).
        msg_start: usize,
        /// Last message (inclusive).
        msg_end: usize,
    },
    /// Breakpoint application produced nothing.
    #[error("Chunking produced no chunks for {conversation_id}")]
    NoChunks {
        /// Conversation id.
        conversation_id: String,
    },
    /// Writing a chunk file failed.
    #[error("Failed to write chunk {}: {source}", path.display())]
    Write {
        /// Chunk file.
        path: PathBuf,
        /// Writer failure.
        #[source]
        source: AtomicWriteError,
    },
    /// The run was cancelled between threads.
    #[error("Chunking cancelled")]
    Cancelled,
}

/// Output policy for chunk files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOptions {
    /// Replace existing chunk files.
    pub overwrite: bool,
    /// Indent output JSON.
    pub pretty: bool,
}

/// Outcome of chunking a set of thread files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkRunSummary {
    /// Thread files chunked.
    pub threads_processed: usize,
    /// Chunk files written, in thread order.
    pub chunk_paths: Vec<PathBuf>,
}

/// Deterministic breakpoints: every multiple of `target` below `total_turns`.
///
/// Empty when `target` is 0 or the thread already fits in one chunk.
pub fn fallback_breakpoints(total_turns: usize, target: usize) -> Vec<i64> {
    if target == 0 || total_turns <= target {
        return Vec::new();
    }
    (target..total_turns)
        .step_by(target)
        .map(|b| b as i64)
        .collect()
}

/// Convert raw turn breakpoints into chunks of `thread`.
///
/// `chunk_number` and `thread_start` are stamped here as well, so the
/// returned chunks are ready to write.
pub fn apply_breakpoints(
    thread: &SimplifiedConversation,
    turns: &[Turn],
    raw: &[i64],
) -> Result<Vec<Chunk>, ChunkError> {
    let set = BreakpointSet::normalize(raw, turns.len());
    let dropped = raw.len() - set.len();
    if dropped > 0 {
        tracing::debug!(
            conversation_id = %thread.conversation_id,
            total_turns = turns.len(),
            dropped,
            "Dropped duplicate or out-of-range breakpoints"
        );
    }

    let thread_start = thread.start_time();
    let mut chunks = Vec::with_capacity(set.len() + 1);

    for (turn_start, turn_end) in set.turn_ranges() {
        let msg_start = turns[turn_start].start_message_index;
        let msg_end = turns[turn_end - 1].end_message_index;
        if msg_end < msg_start || msg_end >= thread.messages.len() {
            return Err(ChunkError::InvalidMessageRange {
                conversation_id: thread.conversation_id.clone(),
                turn_start,
                turn_end,
                msg_start,
                msg_end,
            });
        }

        chunks.push(Chunk {
            conversation_id: thread.conversation_id.clone(),
            title: thread.title.clone(),
            thread_start,
            chunk_number: chunks.len() + 1,
            turn_start,
            turn_end,
            messages: thread.messages[msg_start..=msg_end].to_vec(),
        });
    }

    if chunks.is_empty() {
        return Err(ChunkError::NoChunks { conversation_id: thread.conversation_id.clone() });
    }
    Ok(chunks)
}

/// File name of a chunk: `<floor(unix seconds)>_<n>.json`, or
/// `thread_<n>.json` when the start time is absent or not positive.
pub fn chunk_file_name(thread_start: Option<f64>, chunk_number: usize) -> String {
    let stem = match thread_start.map(f64::floor) {
        Some(secs) if secs >= 1.0 => format!("{}", secs as i64),
        _ => UNTIMED_STEM.to_string(),
    };
    format!("{stem}_{chunk_number}.json")
}

/// Chunk one thread file into `out_dir`.
///
/// Returns the written chunk paths in chunk order. A decider failure after
/// `cancel` fired is reported as [`ChunkError::Cancelled`].
pub fn chunk_thread(
    thread_path: &Path,
    out_dir: &Path,
    decider: &dyn BreakpointDecider,
    target_turns_per_chunk: usize,
    options: &ChunkOptions,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, ChunkError> {
    if target_turns_per_chunk == 0 {
        return Err(ChunkError::InvalidTarget);
    }

    let bytes = fs::read(thread_path)
        .map_err(|source| ChunkError::ReadThread { path: thread_path.to_path_buf(), source })?;
    let thread: SimplifiedConversation = serde_json::from_slice(&bytes)
        .map_err(|source| ChunkError::ParseThread { path: thread_path.to_path_buf(), source })?;

    let turns = build_turns(&thread.messages);
    if turns.is_empty() {
        return Err(ChunkError::NoTurns { path: thread_path.to_path_buf() });
    }

    if cancel.is_cancelled() {
        return Err(ChunkError::Cancelled);
    }
    let mut breakpoints = match decider.decide(&thread, &turns, target_turns_per_chunk, cancel) {
        Ok(points) => points,
        Err(_) if cancel.is_cancelled() => return Err(ChunkError::Cancelled),
        Err(source) => {
            return Err(ChunkError::Decide { conversation_id: thread.conversation_id.clone(), source })
        }
    };
    if breakpoints.is_empty() {
        breakpoints = fallback_breakpoints(turns.len(), target_turns_per_chunk);
    }

    let chunks = apply_breakpoints(&thread, &turns, &breakpoints)?;
    let writer = AtomicFileWriter::new(options.overwrite, options.pretty);

    let mut written = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let path = out_dir.join(chunk_file_name(chunk.thread_start, chunk.chunk_number));
        writer
            .write_json(&path, chunk)
            .map_err(|source| ChunkError::Write { path: path.clone(), source })?;
        written.push(path);
    }

    tracing::debug!(
        conversation_id = %thread.conversation_id,
        turns = turns.len(),
        chunks = written.len(),
        "Chunked thread"
    );
    Ok(written)
}

/// Thread files under `input`: the file itself, or the sorted `*.json`
/// files directly inside a directory.
pub fn collect_thread_files(input: &Path) -> Result<Vec<PathBuf>, ChunkError> {
    let metadata = fs::metadata(input)
        .map_err(|source| ChunkError::ListInput { path: input.to_path_buf(), source })?;

    if !metadata.is_dir() {
        if !has_json_extension(input) {
            return Err(ChunkError::InvalidInput { path: input.to_path_buf() });
        }
        return Ok(vec![input.to_path_buf()]);
    }

    let entries = fs::read_dir(input)
        .map_err(|source| ChunkError::ListInput { path: input.to_path_buf(), source })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ChunkError::ListInput { path: input.to_path_buf(), source })?;
        let file_type = entry
            .file_type()
            .map_err(|source| ChunkError::ListInput { path: entry.path(), source })?;
        let path = entry.path();
        if file_type.is_file() && has_json_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Chunk every thread under `input` into `out_dir`.
///
/// Each thread's chunks go to a subdirectory named after the thread file
/// stem, so threads sharing a start second never collide. Fails fast on
/// the first thread error.
pub fn chunk_directory(
    input: &Path,
    out_dir: &Path,
    decider: &dyn BreakpointDecider,
    target_turns_per_chunk: usize,
    options: &ChunkOptions,
    cancel: &CancellationToken,
) -> Result<ChunkRunSummary, ChunkError> {
    let files = collect_thread_files(input)?;
    let mut summary = ChunkRunSummary::default();

    for file in &files {
        if cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNTIMED_STEM.to_string());
        let written = chunk_thread(file, &out_dir.join(stem), decider, target_turns_per_chunk, options, cancel)?;
        summary.threads_processed += 1;
        summary.chunk_paths.extend(written);
    }

    tracing::info!(
        input = %input.display(),
        out_dir = %out_dir.display(),
        threads_processed = summary.threads_processed,
        chunks_written = summary.chunk_paths.len(),
        "Chunking complete"
    );
    Ok(summary)
}

fn has_json_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FixedStrideDecider;
    use crate::types::SimplifiedMessage;

    /// A thread of `n` single-message user turns.
    fn thread(n: usize, create_time: Option<f64>) -> SimplifiedConversation {
        SimplifiedConversation {
            conversation_id: "conv".into(),
            title: "Title".into(),
            create_time,
            update_time: None,
            messages: (0..n)
                .map(|i| SimplifiedMessage::new("user", format!("q{i}")).at(10.0 + i as f64))
                .collect(),
        }
    }

    struct FixedDecider(Vec<i64>);

    impl BreakpointDecider for FixedDecider {
        fn decide(
            &self,
            _: &SimplifiedConversation,
            _: &[Turn],
            _: usize,
            _: &CancellationToken,
        ) -> Result<Vec<i64>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDecider;

    impl BreakpointDecider for FailingDecider {
        fn decide(
            &self,
            _: &SimplifiedConversation,
            _: &[Turn],
            _: usize,
            _: &CancellationToken,
        ) -> Result<Vec<i64>, ProviderError> {
            Err(ProviderError::new("model unavailable"))
        }
    }

    fn write_thread(dir: &Path, name: &str, t: &SimplifiedConversation) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_vec(t).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_fallback_breakpoints() {
        assert_eq!(fallback_breakpoints(55, 20), vec![20, 40]);
        assert_eq!(fallback_breakpoints(40, 20), vec![20]);
        assert!(fallback_breakpoints(20, 20).is_empty());
        assert!(fallback_breakpoints(5, 0).is_empty());
    }

    #[test]
    fn test_apply_matches_turn_ranges() {
        let t = thread(55, Some(1_700_000_000.7));
        let turns = build_turns(&t.messages);

        let chunks = apply_breakpoints(&t, &turns, &[40, 20, 20, 0, 99]).unwrap();

        let ranges: Vec<(usize, usize)> = chunks.iter().map(|c| (c.turn_start, c.turn_end)).collect();
        assert_eq!(ranges, vec![(0, 20), (20, 40), (40, 55)]);
        let numbers: Vec<usize> = chunks.iter().map(|c| c.chunk_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(chunks[2].messages.len(), 15);
        assert_eq!(chunks[1].messages[0].text, "q20");
        assert!(chunks.iter().all(|c| c.thread_start == Some(1_700_000_000.7)));
    }

    #[test]
    fn test_thread_start_falls_back_to_first_message() {
        let t = thread(3, None);
        let turns = build_turns(&t.messages);

        let chunks = apply_breakpoints(&t, &turns, &[]).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].thread_start, Some(10.0));
    }

    #[test]
    fn test_chunk_file_names() {
        assert_eq!(chunk_file_name(Some(1_700_000_000.9), 2), "1700000000_2.json");
        assert_eq!(chunk_file_name(None, 1), "thread_1.json");
        assert_eq!(chunk_file_name(Some(0.4), 3), "thread_3.json");
        assert_eq!(chunk_file_name(Some(-5.0), 1), "thread_1.json");
    }

    #[test]
    fn test_chunk_thread_uses_fallback_when_decider_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_thread(dir.path(), "t.json", &thread(5, Some(1000.0)));
        let out = dir.path().join("out");

        let decider = FixedDecider(Vec::new());
        let written =
            chunk_thread(&path, &out, &decider, 2, &ChunkOptions::default(), &CancellationToken::new()).unwrap();

        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["1000_1.json", "1000_2.json", "1000_3.json"]);

        let last: Chunk = serde_json::from_slice(&fs::read(&written[2]).unwrap()).unwrap();
        assert_eq!((last.turn_start, last.turn_end, last.chunk_number), (4, 5, 3));
    }

    #[test]
    fn test_chunk_thread_refuses_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_thread(dir.path(), "t.json", &thread(2, Some(1000.0)));
        let out = dir.path().join("out");
        let decider = FixedStrideDecider::new();
        let cancel = CancellationToken::new();

        chunk_thread(&path, &out, &decider, 5, &ChunkOptions::default(), &cancel).unwrap();
        let second = chunk_thread(&path, &out, &decider, 5, &ChunkOptions::default(), &cancel);
        assert!(matches!(second, Err(ChunkError::Write { .. })));

        let options = ChunkOptions { overwrite: true, ..Default::default() };
        assert_eq!(chunk_thread(&path, &out, &decider, 5, &options, &cancel).unwrap().len(), 1);
    }

    #[test]
    fn test_chunk_thread_errors() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write_thread(dir.path(), "empty.json", &thread(0, None));
        let full = write_thread(dir.path(), "full.json", &thread(2, None));
        let out = dir.path().join("out");
        let options = ChunkOptions::default();
        let cancel = CancellationToken::new();

        assert!(matches!(
            chunk_thread(&full, &out, &FixedStrideDecider, 0, &options, &cancel),
            Err(ChunkError::InvalidTarget)
        ));
        assert!(matches!(
            chunk_thread(&empty, &out, &FixedStrideDecider, 2, &options, &cancel),
            Err(ChunkError::NoTurns { .. })
        ));
        assert!(matches!(
            chunk_thread(&full, &out, &FailingDecider, 2, &options, &cancel),
            Err(ChunkError::Decide { conversation_id, .. }) if conversation_id == "conv"
        ));
    }

    #[test]
    fn test_chunk_directory_uses_per_thread_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let threads = dir.path().join("threads");
        fs::create_dir_all(threads.join("chunks")).unwrap();
        write_thread(&threads, "b.json", &thread(3, Some(1000.0)));
        write_thread(&threads, "a.json", &thread(3, Some(1000.0)));
        fs::write(threads.join("notes.txt"), "ignored").unwrap();
        let out = dir.path().join("chunks");

        let summary = chunk_directory(
            &threads,
            &out,
            &FixedStrideDecider,
            2,
            &ChunkOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(summary.threads_processed, 2);
        assert_eq!(summary.chunk_paths.len(), 4);
        assert_eq!(summary.chunk_paths[0], out.join("a").join("1000_1.json"));
        assert!(out.join("b").join("1000_2.json").exists());
    }

    /// Cancels the run from inside the decider, as a model call would on shutdown.
    struct CancellingDecider(CancellationToken);

    impl BreakpointDecider for CancellingDecider {
        fn decide(
            &self,
            _: &SimplifiedConversation,
            _: &[Turn],
            _: usize,
            cancel: &CancellationToken,
        ) -> Result<Vec<i64>, ProviderError> {
            self.0.cancel();
            if cancel.is_cancelled() {
                return Err(ProviderError::cancelled());
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_cancelled_decider_stops_directory_run() {
        let dir = tempfile::tempdir().unwrap();
        let threads = dir.path().join("threads");
        fs::create_dir_all(&threads).unwrap();
        write_thread(&threads, "a.json", &thread(3, Some(1000.0)));
        write_thread(&threads, "b.json", &thread(3, Some(1000.0)));
        let out = dir.path().join("chunks");
        let cancel = CancellationToken::new();

        let result = chunk_directory(
            &threads,
            &out,
            &CancellingDecider(cancel.clone()),
            2,
            &ChunkOptions::default(),
            &cancel,
        );

        assert!(matches!(result, Err(ChunkError::Cancelled)));
        assert!(!out.join("a").exists());
    }
}
