//! Bounded windows for two-tier rollup.
//!
//! Long per-thread item lists are cut into consecutive windows. Each window
//! is rolled up on its own into a partial summary, persisted as a part file,
//! and the partials are merged once every window has finished. The windower
//! only manages sizes; it never looks at content.
//!
//! The core owns identity: every partial and the merged result are stamped
//! with the conversation id and the minimum non-null thread start of their
//! inputs, whatever the rolluper returned.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::atomic::{AtomicFileWriter, AtomicWriteError};
use tokio_util::sync::CancellationToken;
use crate::provider::ProviderError;
use crate::types::{ThreadArtifact, ThreadStart};

/// Error type for windowed rollups.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// Rolling up one window failed.
    #[error("Failed rollup {conversation_id} part={part}/{total}: {source}")]
    Rollup {
        /// Conversation id.
        conversation_id: String,
        /// 1-based window number.
        part: usize,
        /// Window count.
        total: usize,
        /// Rolluper failure.
        #[source]
        source: ProviderError,
    },
    /// Merging the partial summaries failed.
    #[error("Failed rollup merge {conversation_id}: {source}")]
    Merge {
        /// Conversation id.
        conversation_id: String,
        /// Rolluper failure.
        #[source]
        source: ProviderError,
    },
    /// A part file exists and neither resume nor overwrite is enabled.
    #[error("Thread summary part exists: {}", path.display())]
    PartExists {
        /// Part file.
        path: PathBuf,
    },
    /// Reading a reused part file failed.
    #[error("Failed to read part {}: {source}", path.display())]
    ReadPart {
        /// Part file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A reused part file is not a valid summary.
    #[error("Failed to parse part {}: {source}", path.display())]
    ParsePart {
        /// Part file.
        path: PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// Writing a part file failed.
    #[error(transparent)]
    Write(#[from] AtomicWriteError),
    /// Cancelled before a rollup call.
    #[error("Rollup cancelled")]
    Cancelled,
}

/// Split `items` into consecutive windows of at most `max` items.
///
/// A `max` of 0, or a list that already fits, yields a single window (which
/// is empty for empty input).
pub fn chunk_windows<T>(items: &[T], max: usize) -> Vec<&[T]> {
    if max == 0 || items.len() <= max {
        return vec![items];
    }
    items.chunks(max).collect()
}

/// Minimum non-null thread start across `items`.
pub fn min_thread_start<T: ThreadStart>(items: &[T]) -> Option<f64> {
    items
        .iter()
        .filter_map(|item| item.thread_start())
        .fold(None, |min: Option<f64>, t| Some(min.map_or(t, |m| m.min(t))))
}

/// Naming and reuse policy for persisted partial summaries.
///
/// Parts are named `<stem>.partNNofMM.json` inside `dir`.
#[derive(Debug, Clone)]
pub struct PartFiles {
    dir: PathBuf,
    stem: String,
    resume: bool,
    overwrite: bool,
    pretty: bool,
}

impl PartFiles {
    /// Create a part policy for one thread artifact.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            resume: false,
            overwrite: false,
            pretty: false,
        }
    }

    /// Reuse existing parts instead of failing on them.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Regenerate existing parts.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Indent part JSON.
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Path of part `part` of `total` (both 1-based).
    pub fn path(&self, part: usize, total: usize) -> PathBuf {
        self.dir.join(format!("{}.part{:02}of{:02}.json", self.stem, part, total))
    }

    fn load<O: ThreadArtifact>(path: &Path) -> Result<O, WindowError> {
        let bytes = fs::read(path)
            .map_err(|source| WindowError::ReadPart { path: path.to_path_buf(), source })?;
        serde_json::from_slice(&bytes)
            .map_err(|source| WindowError::ParsePart { path: path.to_path_buf(), source })
    }
}

/// Roll `items` up into one thread artifact, windowing when needed.
///
/// With a single window the rolluper is called once and no part file is
/// written. Otherwise each window becomes a part file (reused on resume)
/// and `merge` runs after all windows have finished.
pub fn rollup_windowed<I, O, R, M>(
    conversation_id: &str,
    items: &[I],
    max_per_window: usize,
    parts: &PartFiles,
    cancel: &CancellationToken,
    rollup: R,
    merge: M,
) -> Result<O, WindowError>
where
    I: ThreadStart,
    O: ThreadArtifact,
    R: Fn(&[I]) -> Result<O, ProviderError>,
    M: Fn(&[O]) -> Result<O, ProviderError>,
{
    let thread_start = min_thread_start(items);
    let windows = chunk_windows(items, max_per_window);
    let total = windows.len();

    if total == 1 {
        if cancel.is_cancelled() {
            return Err(WindowError::Cancelled);
        }
        let mut out = rollup(items).map_err(|source| WindowError::Rollup {
            conversation_id: conversation_id.to_string(),
            part: 1,
            total: 1,
            source,
        })?;
        out.stamp(conversation_id, thread_start);
        return Ok(out);
    }

    let writer = AtomicFileWriter::new(true, parts.pretty);
    let mut partials: Vec<O> = Vec::with_capacity(total);

    for (i, window) in windows.into_iter().enumerate() {
        let part = i + 1;
        let path = parts.path(part, total);
        let regenerate = parts.overwrite || !path.exists();

        if !regenerate {
            if !parts.resume {
                return Err(WindowError::PartExists { path });
            }
            tracing::debug!(conversation_id, part, total, path = %path.display(), "Reusing rollup part");
            partials.push(PartFiles::load(&path)?);
            continue;
        }

        if cancel.is_cancelled() {
            return Err(WindowError::Cancelled);
        }
        let mut partial = rollup(window).map_err(|source| WindowError::Rollup {
            conversation_id: conversation_id.to_string(),
            part,
            total,
            source,
        })?;
        partial.stamp(conversation_id, min_thread_start(window));
        writer.write_json(&path, &partial)?;
        partials.push(partial);
    }

    if cancel.is_cancelled() {
        return Err(WindowError::Cancelled);
    }
    let mut merged = merge(partials.as_slice()).map_err(|source| WindowError::Merge {
        conversation_id: conversation_id.to_string(),
        source,
    })?;
    merged.stamp(conversation_id, thread_start);

    tracing::debug!(conversation_id, parts = total, items = items.len(), "Merged windowed rollup");
    Ok(merged)
}
