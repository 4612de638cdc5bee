//! Chunk types: summarization-sized slices of a thread.

use serde::{Deserialize, Serialize};

use super::{null_as_default, SimplifiedMessage};

/// A contiguous turn range of one thread with an owned copy of its messages.
///
/// Chunks of one thread cover `[0, total_turns)` exactly once and
/// `chunk_number` equals the 1-based position in the emitted sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Conversation this chunk belongs to.
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversation_id: String,
    /// Thread title.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Thread start in unix seconds.
    #[serde(rename = "thread_start_time", default, skip_serializing_if = "Option::is_none")]
    pub thread_start: Option<f64>,
    /// 1-based chunk number.
    #[serde(default)]
    pub chunk_number: usize,
    /// First turn (inclusive).
    #[serde(default)]
    pub turn_start: usize,
    /// Last turn (exclusive).
    #[serde(default)]
    pub turn_end: usize,
    /// Messages of the covered turns.
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<SimplifiedMessage>,
}

impl Chunk {
    /// Number of turns covered.
    pub fn turn_count(&self) -> usize {
        self.turn_end.saturating_sub(self.turn_start)
    }

    /// Whether the identity fields of a chunk file are present.
    pub fn has_identity(&self) -> bool {
        !self.conversation_id.is_empty() && self.chunk_number != 0
    }
}

/// Normalized breakpoint list.
///
/// Sorted, deduplicated turn indices strictly inside `(0, total_turns)`.
/// Each marks the first turn of a new chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointSet {
    points: Vec<usize>,
    total_turns: usize,
}

impl BreakpointSet {
    /// Normalize raw breakpoints against a turn count.
    ///
    /// Values `<= 0` or `>= total_turns` are dropped; so is everything when
    /// the thread has at most one turn.
    pub fn normalize(raw: &[i64], total_turns: usize) -> Self {
        if total_turns <= 1 {
            return Self { points: Vec::new(), total_turns };
        }

        let mut points: Vec<usize> = raw
            .iter()
            .filter_map(|&b| usize::try_from(b).ok())
            .filter(|&b| b > 0 && b < total_turns)
            .collect();
        points.sort_unstable();
        points.dedup();

        Self { points, total_turns }
    }

    /// Normalized breakpoints.
    pub fn as_slice(&self) -> &[usize] {
        &self.points
    }

    /// Number of breakpoints.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no breakpoint survived normalization.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Turn count the set was normalized against.
    pub fn total_turns(&self) -> usize {
        self.total_turns
    }

    /// Chunk boundaries: `[0] + breakpoints + [total_turns]`.
    pub fn boundaries(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.points.len() + 2);
        out.push(0);
        out.extend_from_slice(&self.points);
        out.push(self.total_turns);
        out
    }

    /// Half-open turn ranges `(start, end)` with `start < end`.
    pub fn turn_ranges(&self) -> Vec<(usize, usize)> {
        self.boundaries()
            .windows(2)
            .filter(|w| w[0] < w[1])
            .map(|w| (w[0], w[1]))
            .collect()
    }
}
