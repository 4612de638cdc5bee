//! Core types for archive decomposition.
//!
//! Raw export shapes exist only while one conversation element is parsed.
//! Everything downstream of the splitter works on simplified threads,
//! turns and chunks, which are also the on-disk formats.

pub mod conversation;
pub mod turn;
pub mod chunk;
pub mod summary;

pub use conversation::{
    SimplifiedConversation, SimplifiedMessage, RawConversation, RawNode, RawMessage, RawAuthor,
    ROLE_USER, ROLE_SYSTEM, ROLE_TOOL, ROLE_UNKNOWN,
};
pub use turn::Turn;
pub use chunk::{Chunk, BreakpointSet};
pub use summary::{
    ChunkSummary, ThreadSummary, ChunkSentimentSummary, ThreadSentimentSummary,
    ChunkSummaryDraft, ChunkSentimentDraft, GlossaryAddition,
    ThreadStart, ChunkArtifact, ThreadArtifact,
};

use serde::{Deserialize, Deserializer};

/// Deserialize `null` as the type's default.
///
/// Exports and model output use `null` and absent interchangeably for empty
/// strings and lists.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
