//! Summary artifacts exchanged with the external summarizers and rollupers.
//!
//! The core never interprets summary prose. It stamps identity fields
//! (conversation id, chunk position, thread start) onto whatever the
//! collaborators return, so those fields stay correct regardless of model
//! behavior.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{null_as_default, Chunk};

/// Anything carrying an optional thread start time.
pub trait ThreadStart {
    /// Thread start in unix seconds.
    fn thread_start(&self) -> Option<f64>;
}

/// A per-chunk summary file, groupable by conversation.
pub trait ChunkArtifact: ThreadStart + DeserializeOwned + Send {
    /// Conversation the chunk belongs to.
    fn conversation_id(&self) -> &str;
    /// Ordering key inside a thread: chunk number, then first turn.
    fn order_key(&self) -> (usize, usize);
}

/// A thread-level rollup result.
pub trait ThreadArtifact: ThreadStart + Serialize + DeserializeOwned + Send {
    /// Overwrite the identity fields owned by the core.
    fn stamp(&mut self, conversation_id: &str, thread_start: Option<f64>);
}

/// A term proposed for the run glossary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryAddition {
    /// Term.
    #[serde(default, deserialize_with = "null_as_default")]
    pub term: String,
    /// Optional definition.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub definition: String,
}

impl GlossaryAddition {
    /// An addition without a definition.
    pub fn bare(term: impl Into<String>) -> Self {
        Self { term: term.into(), definition: String::new() }
    }
}

/// Semantic summary content returned by a chunk summarizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummaryDraft {
    /// Prose summary.
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    /// Retrievable claims.
    #[serde(default, deserialize_with = "null_as_default")]
    pub key_points: Vec<String>,
    /// Topic tags.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    /// Glossary terms referenced.
    #[serde(default, deserialize_with = "null_as_default")]
    pub terms: Vec<String>,
    /// New or refined glossary entries.
    #[serde(default, deserialize_with = "null_as_default")]
    pub glossary_additions: Vec<GlossaryAddition>,
}

/// Sentiment content returned by a chunk sentiment summarizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSentimentDraft {
    /// How the chunk felt.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_summary: String,
    /// Emotions clearly present.
    #[serde(default, deserialize_with = "null_as_default")]
    pub dominant_emotions: Vec<String>,
    /// Emotions recalled about past events.
    #[serde(default, deserialize_with = "null_as_default")]
    pub remembered_emotions: Vec<String>,
    /// Emotions enacted in the interaction itself.
    #[serde(default, deserialize_with = "null_as_default")]
    pub present_emotions: Vec<String>,
    /// Coexisting contrasts, as "X vs Y".
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_tensions: Vec<String>,
    /// How the relationship changed.
    #[serde(default, deserialize_with = "null_as_default")]
    pub relational_shift: String,
    /// Change of stance across the chunk.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_arc: String,
    /// Recurring themes.
    #[serde(default, deserialize_with = "null_as_default")]
    pub themes: Vec<String>,
    /// Motifs used meaningfully.
    #[serde(default, deserialize_with = "null_as_default")]
    pub symbols_or_metaphors: Vec<String>,
    /// Why it felt significant.
    #[serde(default, deserialize_with = "null_as_default")]
    pub resonance_notes: String,
    /// Compact tone indicators.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tone_markers: Vec<String>,
}

/// Semantic summary of one chunk (`*.summary.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    /// Conversation id.
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversation_id: String,
    /// Thread start.
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
    /// Prose summary.
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    /// Retrievable claims.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub key_points: Vec<String>,
    /// Topic tags.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Glossary terms.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
}

impl ChunkSummary {
    /// Combine a chunk's identity with a summarizer draft.
    pub fn from_draft(chunk: &Chunk, draft: ChunkSummaryDraft) -> Self {
        Self {
            conversation_id: chunk.conversation_id.clone(),
            thread_start: chunk.thread_start,
            chunk_number: chunk.chunk_number,
            turn_start: chunk.turn_start,
            turn_end: chunk.turn_end,
            summary: draft.summary,
            key_points: draft.key_points,
            tags: draft.tags,
            terms: draft.terms,
        }
    }
}

/// Sentiment summary of one chunk (`*.sentiment.summary.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSentimentSummary {
    /// Conversation id.
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversation_id: String,
    /// Thread start.
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
    /// How the chunk felt.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_summary: String,
    /// Emotions clearly present.
    #[serde(default, deserialize_with = "null_as_default")]
    pub dominant_emotions: Vec<String>,
    /// Emotions recalled about past events.
    #[serde(default, deserialize_with = "null_as_default")]
    pub remembered_emotions: Vec<String>,
    /// Emotions enacted in the interaction.
    #[serde(default, deserialize_with = "null_as_default")]
    pub present_emotions: Vec<String>,
    /// Coexisting contrasts.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_tensions: Vec<String>,
    /// Relationship change.
    #[serde(default, deserialize_with = "null_as_default")]
    pub relational_shift: String,
    /// Change of stance.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_arc: String,
    /// Recurring themes.
    #[serde(default, deserialize_with = "null_as_default")]
    pub themes: Vec<String>,
    /// Motifs.
    #[serde(default, deserialize_with = "null_as_default")]
    pub symbols_or_metaphors: Vec<String>,
    /// Significance notes.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub resonance_notes: String,
    /// Tone indicators.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub tone_markers: Vec<String>,
}

impl ChunkSentimentSummary {
    /// Combine a chunk's identity with a sentiment draft.
    pub fn from_draft(chunk: &Chunk, draft: ChunkSentimentDraft) -> Self {
        Self {
            conversation_id: chunk.conversation_id.clone(),
            thread_start: chunk.thread_start,
            chunk_number: chunk.chunk_number,
            turn_start: chunk.turn_start,
            turn_end: chunk.turn_end,
            emotional_summary: draft.emotional_summary,
            dominant_emotions: draft.dominant_emotions,
            remembered_emotions: draft.remembered_emotions,
            present_emotions: draft.present_emotions,
            emotional_tensions: draft.emotional_tensions,
            relational_shift: draft.relational_shift,
            emotional_arc: draft.emotional_arc,
            themes: draft.themes,
            symbols_or_metaphors: draft.symbols_or_metaphors,
            resonance_notes: draft.resonance_notes,
            tone_markers: draft.tone_markers,
        }
    }
}

/// Semantic summary of a whole thread (`*.thread.summary.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// Conversation id.
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversation_id: String,
    /// Thread title.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Earliest thread start across the rolled-up inputs.
    #[serde(rename = "thread_start_time", default, skip_serializing_if = "Option::is_none")]
    pub thread_start: Option<f64>,
    /// Prose summary.
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    /// Retrievable claims.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub key_points: Vec<String>,
    /// Topic tags.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Glossary terms.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
}

/// Sentiment summary of a whole thread (`*.thread.sentiment.summary.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadSentimentSummary {
    /// Conversation id.
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversation_id: String,
    /// Thread title.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Earliest thread start across the rolled-up inputs.
    #[serde(rename = "thread_start_time", default, skip_serializing_if = "Option::is_none")]
    pub thread_start: Option<f64>,
    /// How the thread felt.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_summary: String,
    /// Emotions clearly present.
    #[serde(default, deserialize_with = "null_as_default")]
    pub dominant_emotions: Vec<String>,
    /// Emotions recalled about past events.
    #[serde(default, deserialize_with = "null_as_default")]
    pub remembered_emotions: Vec<String>,
    /// Emotions enacted in the interaction.
    #[serde(default, deserialize_with = "null_as_default")]
    pub present_emotions: Vec<String>,
    /// Coexisting contrasts.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_tensions: Vec<String>,
    /// Relationship change.
    #[serde(default, deserialize_with = "null_as_default")]
    pub relational_shift: String,
    /// Change of stance.
    #[serde(default, deserialize_with = "null_as_default")]
    pub emotional_arc: String,
    /// Recurring themes.
    #[serde(default, deserialize_with = "null_as_default")]
    pub themes: Vec<String>,
    /// Motifs.
    #[serde(default, deserialize_with = "null_as_default")]
    pub symbols_or_metaphors: Vec<String>,
    /// Significance notes.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub resonance_notes: String,
    /// Tone indicators.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub tone_markers: Vec<String>,
}

impl ThreadStart for ChunkSummary {
    fn thread_start(&self) -> Option<f64> {
        self.thread_start
    }
}

impl ThreadStart for ChunkSentimentSummary {
    fn thread_start(&self) -> Option<f64> {
        self.thread_start
    }
}

impl ThreadStart for ThreadSummary {
    fn thread_start(&self) -> Option<f64> {
        self.thread_start
    }
}

impl ThreadStart for ThreadSentimentSummary {
    fn thread_start(&self) -> Option<f64> {
        self.thread_start
    }
}

impl ChunkArtifact for ChunkSummary {
    fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    fn order_key(&self) -> (usize, usize) {
        (self.chunk_number, self.turn_start)
    }
}

impl ChunkArtifact for ChunkSentimentSummary {
    fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    fn order_key(&self) -> (usize, usize) {
        (self.chunk_number, self.turn_start)
    }
}

impl ThreadArtifact for ThreadSummary {
    fn stamp(&mut self, conversation_id: &str, thread_start: Option<f64>) {
        self.conversation_id = conversation_id.to_string();
        self.thread_start = thread_start;
        self.title = self.title.trim().to_string();
        self.summary = self.summary.trim().to_string();
    }
}

impl ThreadArtifact for ThreadSentimentSummary {
    fn stamp(&mut self, conversation_id: &str, thread_start: Option<f64>) {
        self.conversation_id = conversation_id.to_string();
        self.thread_start = thread_start;
        self.title = self.title.trim().to_string();
        self.emotional_summary = self.emotional_summary.trim().to_string();
    }
}
