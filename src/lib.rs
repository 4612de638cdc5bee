//! # archive-resegmenter
//!
//! Streaming decomposition of conversation archives into linear threads
//! and summarization-sized chunks.
//!
//! The crate answers one question:
//!
//! > Given a multi-gigabyte export of branching conversations, which
//! > bounded, ordered slices should a summarizer see?
//!
//! ## Core Contract
//!
//! 1. Stream the export one conversation at a time and write one linear
//!    thread file per conversation
//! 2. Group each thread into user-initiated turns and cut it into chunks at
//!    turn boundaries, covering every turn exactly once
//! 3. Roll chunk summaries up into thread summaries, windowing oversized
//!    threads, under bounded concurrency with resume
//!
//! ## Architecture
//!
//! ```text
//! export.json → ArchiveSplitter ──(linearize)──▶ threads/*.json
//!                                                   ↓
//!                        build_turns → BreakpointDecider → apply_breakpoints
//!                                                   ↓
//!                                        threads/chunks/**/*.json
//!                                                   ↓
//!                     BoundedExecutor + ChunkSummarizer + Glossary
//!                                                   ↓
//!                     BoundedExecutor + rollup_windowed + ThreadRolluper
//! ```
//!
//! Every file is written through [`AtomicFileWriter`]: a temp file in the
//! destination directory, synced, then renamed over the target.
//!
//! ## Determinism Guarantees
//!
//! - Same export + same decider output → identical thread and chunk files
//! - Chunk turn ranges partition `[0, total_turns)` in order
//! - Identity fields of summaries are stamped by the core, never the model

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod atomic;
pub mod types;
pub mod linearizer;
pub mod splitter;
pub mod segmenter;
pub mod chunker;
pub mod provider;
pub mod windower;
pub mod glossary;
pub mod pipeline;
pub mod config;

// Re-exports
pub use atomic::{AtomicFileWriter, AtomicWriteError, write_atomic, write_lines_atomic};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    SimplifiedConversation, SimplifiedMessage, Turn, Chunk, BreakpointSet,
    ChunkSummary, ThreadSummary, ChunkSentimentSummary, ThreadSentimentSummary,
    ChunkSummaryDraft, ChunkSentimentDraft, GlossaryAddition,
};
pub use linearizer::{linearize, pick_best_leaf, simplify_message, LinearizeError};
pub use splitter::{
    ArchiveSplitter, SplitOptions, SplitResult, SplitError, ElementErrorPolicy,
    SkippedConversation, sanitize_filename_component,
};
pub use segmenter::build_turns;
pub use chunker::{
    apply_breakpoints, fallback_breakpoints, chunk_thread, chunk_directory,
    ChunkError, ChunkOptions, ChunkRunSummary,
};
pub use provider::{
    BreakpointDecider, FixedStrideDecider, ChunkSummarizer, ChunkSentimentSummarizer,
    ThreadRolluper, ThreadSentimentRolluper, ProviderError,
};
pub use windower::{chunk_windows, rollup_windowed, PartFiles, WindowError};
pub use glossary::{Glossary, GlossaryEntry, GlossaryError, GLOSSARY_VERSION};
pub use pipeline::{
    Pipeline, PipelineError, PipelineLayout, PipelineReport, Stage, StageSelection,
    ItemError, ItemFailureReport,
};
pub use pipeline::executor::{BoundedExecutor, ExecutorConfig, ExecutorError, BatchOutcome};
pub use pipeline::index::{IndexLimits, IndexRecord, SentimentIndexRecord, ThreadIndexRecord};
pub use pipeline::summarize::{summarize_chunks, SummarizeOptions, SummarizeReport};
pub use pipeline::rollup::{rollup_threads, RollupOptions, RollupReport};
pub use config::{PipelineConfig, ConfigError};

/// Default target turns per chunk.
pub const DEFAULT_TARGET_TURNS_PER_CHUNK: usize = 20;
