//! Turn type: a user message plus the replies that follow it.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// A user-led segment of a thread.
///
/// Turns of one thread are contiguous, non-overlapping, strictly increasing
/// and cover every message exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// 0-based position in the thread.
    pub index: usize,
    /// First message of the turn.
    pub start_message_index: usize,
    /// Last message of the turn (inclusive).
    pub end_message_index: usize,
    /// Creation time of the first message.
    pub start_time: Option<f64>,
    /// User texts, newline-joined.
    pub user_text: String,
    /// Non-user texts (or `title url` link fallbacks), newline-joined.
    pub assistant_text: String,
}

impl Turn {
    /// Message indices covered by this turn.
    pub fn message_range(&self) -> RangeInclusive<usize> {
        self.start_message_index..=self.end_message_index
    }

    /// Number of messages in this turn.
    pub fn message_count(&self) -> usize {
        self.end_message_index + 1 - self.start_message_index
    }
}
