//! Deterministic breakpoint decider.

use super::{BreakpointDecider, ProviderError};
use crate::chunker::fallback_breakpoints;
use crate::types::{SimplifiedConversation, Turn};
use tokio_util::sync::CancellationToken;

/// Breaks every `target_turns_per_chunk` turns.
///
/// Same output as the fallback used when a model decider returns nothing,
/// so runs without a model stay reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedStrideDecider;

impl FixedStrideDecider {
    /// Create a fixed-stride decider.
    pub fn new() -> Self {
        Self
    }
}

impl BreakpointDecider for FixedStrideDecider {
    fn decide(
        &self,
        _thread: &SimplifiedConversation,
        turns: &[Turn],
        target_turns_per_chunk: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<i64>, ProviderError> {
        Ok(fallback_breakpoints(turns.len(), target_turns_per_chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::build_turns;
    use crate::types::SimplifiedMessage;

    #[test]
    fn test_stride_matches_fallback() {
        let messages: Vec<SimplifiedMessage> =
            (0..7).map(|i| SimplifiedMessage::new("user", format!("q{i}"))).collect();
        let thread = SimplifiedConversation {
            conversation_id: "c".into(),
            title: String::new(),
            create_time: None,
            update_time: None,
            messages,
        };
        let turns = build_turns(&thread.messages);

        let points = FixedStrideDecider::new().decide(&thread, &turns, 3, &CancellationToken::new()).unwrap();
        assert_eq!(points, vec![3, 6]);
    }
}
