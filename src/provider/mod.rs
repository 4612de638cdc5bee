//! Collaborator contracts.
//!
//! Model-backed work is injected through these narrow traits. The core
//! hands them already-structured input and stamps identity fields onto
//! whatever they return; it never interprets their prose.

pub mod fixed_stride;

use std::error::Error as StdError;

use tokio_util::sync::CancellationToken;
use crate::types::{
    Chunk, ChunkSentimentDraft, ChunkSentimentSummary, ChunkSummary, ChunkSummaryDraft,
    SimplifiedConversation, ThreadSentimentSummary, ThreadSummary, Turn,
};

/// Opaque failure reported by a collaborator.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ProviderError {
    /// Create an error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    /// Create an error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Error reported when the caller's token was cancelled.
    pub fn cancelled() -> Self {
        Self::new("provider call cancelled")
    }

    /// Description without the source chain.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Decides where a thread is split into chunks.
///
/// Breakpoints are 0-based turn indices that start a new chunk. Returning
/// an empty list selects the deterministic fixed-stride fallback.
pub trait BreakpointDecider: Send + Sync {
    /// Propose breakpoints for `thread`, aiming at `target_turns_per_chunk`.
    ///
    /// Long-running deciders should poll `cancel` and return
    /// [`ProviderError::cancelled`] once it fires.
    fn decide(
        &self,
        thread: &SimplifiedConversation,
        turns: &[Turn],
        target_turns_per_chunk: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<i64>, ProviderError>;
}

/// Produces the semantic summary of one chunk.
pub trait ChunkSummarizer: Send + Sync {
    /// Summarize `chunk`, given the current glossary excerpt.
    fn summarize(
        &self,
        chunk: &Chunk,
        glossary_excerpt: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkSummaryDraft, ProviderError>;
}

/// Produces the sentiment summary of one chunk.
pub trait ChunkSentimentSummarizer: Send + Sync {
    /// Summarize the emotional content of `chunk`.
    fn summarize_sentiment(
        &self,
        chunk: &Chunk,
        glossary_excerpt: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkSentimentDraft, ProviderError>;
}

/// Rolls chunk summaries up into a thread summary.
pub trait ThreadRolluper: Send + Sync {
    /// Summarize one window of ordered chunk summaries.
    fn rollup(
        &self,
        conversation_id: &str,
        items: &[ChunkSummary],
        glossary_excerpt: &str,
        cancel: &CancellationToken,
    ) -> Result<ThreadSummary, ProviderError>;

    /// Merge ordered partial thread summaries into one.
    fn merge(
        &self,
        conversation_id: &str,
        parts: &[ThreadSummary],
        glossary_excerpt: &str,
        cancel: &CancellationToken,
    ) -> Result<ThreadSummary, ProviderError>;
}

/// Rolls chunk sentiment summaries up into a thread sentiment summary.
pub trait ThreadSentimentRolluper: Send + Sync {
    /// Summarize one window of ordered chunk sentiment summaries.
    fn rollup(
        &self,
        conversation_id: &str,
        items: &[ChunkSentimentSummary],
        glossary_excerpt: &str,
        cancel: &CancellationToken,
    ) -> Result<ThreadSentimentSummary, ProviderError>;

    /// Merge ordered partial thread sentiment summaries into one.
    fn merge(
        &self,
        conversation_id: &str,
        parts: &[ThreadSentimentSummary],
        glossary_excerpt: &str,
        cancel: &CancellationToken,
    ) -> Result<ThreadSentimentSummary, ProviderError>;
}

pub use fixed_stride::FixedStrideDecider;
