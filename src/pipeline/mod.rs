//! Pipeline orchestration.
//!
//! Runs the four stages over one base directory:
//!
//! ```text
//! archive ──split──▶ threads/*.json
//!         ──chunk──▶ threads/chunks/<thread>/*.json
//!         ──summarize──▶ threads/summaries/ (+ glossary, indices)
//!         ──rollup──▶ threads/thread_summaries/ (+ sentiment dir, indices)
//! ```
//!
//! The structural stages (split, chunk) always run with the configured
//! breakpoint decider. The model-backed stages need injected collaborators
//! and are reported as skipped when none are wired in.
//!
//! ## Modules
//!
//! - [`executor`]: bounded worker pool, fail-fast and collecting modes
//! - [`summarize`]: chunk-level summaries and the run glossary
//! - [`rollup`]: thread-level rollups with windowing
//! - [`index`]: JSONL retrieval indices

pub mod executor;
pub mod index;
pub mod rollup;
pub mod summarize;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::atomic::AtomicWriteError;
use tokio_util::sync::CancellationToken;
use crate::chunker::{chunk_directory, ChunkError, ChunkOptions, ChunkRunSummary};
use crate::config::PipelineConfig;
use crate::glossary::GlossaryError;
use crate::provider::{
    BreakpointDecider, ChunkSentimentSummarizer, ChunkSummarizer, FixedStrideDecider, ProviderError,
    ThreadRolluper, ThreadSentimentRolluper,
};
use crate::splitter::{ArchiveSplitter, SplitError, SplitOptions, SplitResult};
use crate::windower::WindowError;

use executor::ExecutorConfig;
use index::{IndexError, IndexLimits};
use rollup::{rollup_threads, RollupOptions, RollupReport};
use summarize::{summarize_chunks, SummarizeOptions, SummarizeReport};

/// Failure of one pipeline item (a chunk file or a thread).
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// The input file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        /// Input file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The input file is not valid JSON of the expected shape.
    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        /// Input file.
        path: PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// A chunk file lacks its conversation id or chunk number.
    #[error("Chunk is missing conversation_id or chunk_number: {}", path.display())]
    MissingIdentity {
        /// Chunk file.
        path: PathBuf,
    },
    /// The semantic summarizer failed.
    #[error("Summarizer failed for {}: {source}", path.display())]
    Summarize {
        /// Chunk file.
        path: PathBuf,
        /// Collaborator failure.
        #[source]
        source: ProviderError,
    },
    /// The sentiment summarizer failed.
    #[error("Sentiment summarizer failed for {}: {source}", path.display())]
    Sentiment {
        /// Chunk file.
        path: PathBuf,
        /// Collaborator failure.
        #[source]
        source: ProviderError,
    },
    /// The output exists and neither resume nor overwrite is set.
    #[error("Output already exists (use resume or overwrite): {}", path.display())]
    OutputExists {
        /// Output file.
        path: PathBuf,
    },
    /// Writing an output failed.
    #[error(transparent)]
    Write(#[from] AtomicWriteError),
    /// A windowed rollup failed.
    #[error(transparent)]
    Window(#[from] WindowError),
    /// The item observed cancellation before finishing.
    #[error("Item cancelled")]
    Cancelled,
}

/// One failed item of a tolerant batch.
#[derive(Debug)]
pub struct ItemFailureReport {
    /// Item label (usually a path).
    pub item: String,
    /// Item error.
    pub error: ItemError,
}

fn describe_failures(failures: &[ItemFailureReport]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.item, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error type for pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The run was cancelled.
    #[error("Pipeline cancelled")]
    Cancelled,
    /// The split stage was selected without an archive path.
    #[error("No archive input configured for the split stage")]
    MissingInput,
    /// A chunk summary carries no conversation id.
    #[error("Summary is missing conversation_id: {}", path.display())]
    MissingConversationId {
        /// Summary file.
        path: PathBuf,
    },
    /// A single item failed in a fail-fast stage.
    #[error("{item}: {source}")]
    Item {
        /// Item label.
        item: String,
        /// Item error.
        #[source]
        source: ItemError,
    },
    /// Every item failure of a tolerant batch.
    #[error("{} item(s) failed: {}", .failures.len(), describe_failures(.failures))]
    Aggregate {
        /// Failures, ordered by item.
        failures: Vec<ItemFailureReport>,
    },
    /// Filesystem access outside the atomic writer failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Split stage failure.
    #[error(transparent)]
    Split(#[from] SplitError),
    /// Chunk stage failure.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// Glossary persistence failure.
    #[error(transparent)]
    Glossary(#[from] GlossaryError),
    /// Index rebuild failure.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Output write failure.
    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Archive to per-thread files.
    Split,
    /// Threads to chunk files.
    Chunk,
    /// Chunks to chunk summaries.
    Summarize,
    /// Chunk summaries to thread summaries.
    Rollup,
}

impl Stage {
    /// All stages in order.
    pub const ALL: [Stage; 4] = [Stage::Split, Stage::Chunk, Stage::Summarize, Stage::Rollup];

    /// Lowercase stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Split => "split",
            Stage::Chunk => "chunk",
            Stage::Summarize => "summarize",
            Stage::Rollup => "rollup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised stage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown stage {0:?} (expected split, chunk, summarize or rollup)")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "split" => Ok(Stage::Split),
            "chunk" => Ok(Stage::Chunk),
            "summarize" => Ok(Stage::Summarize),
            "rollup" => Ok(Stage::Rollup),
            _ => Err(UnknownStage(s.to_string())),
        }
    }
}

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StageSelection {
    /// Every stage.
    #[default]
    All,
    /// Exactly one stage.
    Only(Stage),
    /// The given stage and every later one.
    From(Stage),
}

impl StageSelection {
    /// Whether `stage` runs under this selection.
    pub fn includes(&self, stage: Stage) -> bool {
        match self {
            StageSelection::All => true,
            StageSelection::Only(only) => *only == stage,
            StageSelection::From(from) => stage >= *from,
        }
    }
}

/// Directory layout under the pipeline base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLayout {
    /// Base directory.
    pub base: PathBuf,
    /// Per-thread files.
    pub threads: PathBuf,
    /// Chunk files.
    pub chunks: PathBuf,
    /// Chunk summaries, glossary and chunk indices.
    pub summaries: PathBuf,
    /// Thread summaries and thread index.
    pub thread_summaries: PathBuf,
    /// Thread sentiment summaries and their index.
    pub thread_sentiment_summaries: PathBuf,
}

impl PipelineLayout {
    /// Layout rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let threads = base.join("threads");
        Self {
            chunks: threads.join("chunks"),
            summaries: threads.join("summaries"),
            thread_summaries: threads.join("thread_summaries"),
            thread_sentiment_summaries: threads.join("thread_sentiment_summaries"),
            threads,
            base,
        }
    }
}

/// What a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Split outcome, when the stage ran.
    pub split: Option<SplitResult>,
    /// Chunk outcome, when the stage ran.
    pub chunk: Option<ChunkRunSummary>,
    /// Summarize outcome, when the stage ran.
    pub summarize: Option<SummarizeReport>,
    /// Rollup outcome, when the stage ran.
    pub rollup: Option<RollupReport>,
    /// Selected stages that were skipped.
    pub skipped: Vec<Stage>,
}

/// Chunk summarizers injected for the summarize stage.
#[derive(Clone)]
struct Summarizers {
    semantic: Arc<dyn ChunkSummarizer>,
    sentiment: Arc<dyn ChunkSentimentSummarizer>,
}

/// Rollupers injected for the rollup stage.
#[derive(Clone)]
struct Rollupers {
    semantic: Arc<dyn ThreadRolluper>,
    sentiment: Option<Arc<dyn ThreadSentimentRolluper>>,
}

/// Runs the configured stages in order.
pub struct Pipeline {
    config: PipelineConfig,
    layout: PipelineLayout,
    decider: Arc<dyn BreakpointDecider>,
    summarizers: Option<Summarizers>,
    rollupers: Option<Rollupers>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("summarizers", &self.summarizers.is_some())
            .field("rollupers", &self.rollupers.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Pipeline with the fixed-stride decider and no model collaborators.
    pub fn new(config: PipelineConfig) -> Self {
        let layout = PipelineLayout::new(&config.out_dir);
        Self {
            config,
            layout,
            decider: Arc::new(FixedStrideDecider::new()),
            summarizers: None,
            rollupers: None,
        }
    }

    /// Use `decider` for the chunk stage.
    pub fn with_decider(mut self, decider: Arc<dyn BreakpointDecider>) -> Self {
        self.decider = decider;
        self
    }

    /// Enable the summarize stage.
    pub fn with_summarizers(
        mut self,
        semantic: Arc<dyn ChunkSummarizer>,
        sentiment: Arc<dyn ChunkSentimentSummarizer>,
    ) -> Self {
        self.summarizers = Some(Summarizers { semantic, sentiment });
        self
    }

    /// Enable the rollup stage; `sentiment` adds thread sentiment rollups.
    pub fn with_rollupers(
        mut self,
        semantic: Arc<dyn ThreadRolluper>,
        sentiment: Option<Arc<dyn ThreadSentimentRolluper>>,
    ) -> Self {
        self.rollupers = Some(Rollupers { semantic, sentiment });
        self
    }

    /// Directory layout in use.
    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    /// Run every selected stage in order.
    pub fn run(&self, cancel: &CancellationToken) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();

        for stage in Stage::ALL {
            if !self.config.stages.includes(stage) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            tracing::info!(%stage, base = %self.layout.base.display(), "Stage starting");

            let ran = match stage {
                Stage::Split => self.run_split(cancel)?.map(|r| report.split = Some(r)),
                Stage::Chunk => self.run_chunk(cancel)?.map(|r| report.chunk = Some(r)),
                Stage::Summarize => self.run_summarize(cancel)?.map(|r| report.summarize = Some(r)),
                Stage::Rollup => self.run_rollup(cancel)?.map(|r| report.rollup = Some(r)),
            };
            if ran.is_none() {
                report.skipped.push(stage);
            }
        }

        tracing::info!(skipped = report.skipped.len(), "Pipeline finished");
        Ok(report)
    }

    fn run_split(&self, cancel: &CancellationToken) -> Result<Option<SplitResult>, PipelineError> {
        let input = self.config.input.as_deref().ok_or(PipelineError::MissingInput)?;
        if !self.config.overwrite && dir_has_json(&self.layout.threads)? {
            tracing::info!(dir = %self.layout.threads.display(), "Threads already split, skipping");
            return Ok(None);
        }
        let splitter = ArchiveSplitter::new(SplitOptions {
            array_field: self.config.array_field.clone(),
            overwrite: self.config.overwrite,
            pretty: self.config.pretty,
            on_error: self.config.on_error,
        });
        Ok(Some(splitter.split(input, &self.layout.threads, cancel)?))
    }

    fn run_chunk(&self, cancel: &CancellationToken) -> Result<Option<ChunkRunSummary>, PipelineError> {
        if !self.config.overwrite && dir_has_entries(&self.layout.chunks)? {
            tracing::info!(dir = %self.layout.chunks.display(), "Chunks already exist, skipping");
            return Ok(None);
        }
        let options = ChunkOptions { overwrite: self.config.overwrite, pretty: self.config.pretty };
        let summary = chunk_directory(
            &self.layout.threads,
            &self.layout.chunks,
            self.decider.as_ref(),
            self.config.target_turns_per_chunk,
            &options,
            cancel,
        )?;
        Ok(Some(summary))
    }

    fn run_summarize(&self, cancel: &CancellationToken) -> Result<Option<SummarizeReport>, PipelineError> {
        let Some(summarizers) = &self.summarizers else {
            tracing::warn!("No chunk summarizer configured, skipping summarize stage");
            return Ok(None);
        };
        let opts = SummarizeOptions {
            executor: self.executor_config(),
            batch_size: self.config.batch_size,
            max_chunks: self.config.max_chunks,
            resume: self.config.resume,
            overwrite: self.config.overwrite,
            pretty: self.config.pretty,
            glossary_path: None,
            glossary_max_terms: self.config.glossary_max_terms,
            glossary_min_count: self.config.glossary_min_count,
            reindex: self.config.reindex,
            index_limits: self.index_limits(),
        };
        let report = summarize_chunks(
            &self.layout.chunks,
            &self.layout.summaries,
            summarizers.semantic.as_ref(),
            summarizers.sentiment.as_ref(),
            &opts,
            cancel,
        )?;
        Ok(Some(report))
    }

    fn run_rollup(&self, cancel: &CancellationToken) -> Result<Option<RollupReport>, PipelineError> {
        let Some(rollupers) = &self.rollupers else {
            tracing::warn!("No thread rolluper configured, skipping rollup stage");
            return Ok(None);
        };
        let opts = RollupOptions {
            executor: self.executor_config(),
            max_chunks_per_thread: self.config.max_chunks_per_thread,
            resume: self.config.resume,
            overwrite: self.config.overwrite,
            pretty: self.config.pretty,
            glossary_path: None,
            glossary_max_terms: self.config.glossary_max_terms,
            sentiment_out_dir: rollupers
                .sentiment
                .as_ref()
                .map(|_| self.layout.thread_sentiment_summaries.clone()),
            reindex: self.config.reindex,
            index_limits: self.index_limits(),
        };
        let report = rollup_threads(
            &self.layout.summaries,
            &self.layout.thread_summaries,
            rollupers.semantic.as_ref(),
            rollupers.sentiment.as_deref(),
            &opts,
            cancel,
        )?;
        Ok(Some(report))
    }

    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::with_concurrency(self.config.concurrency)
    }

    fn index_limits(&self) -> IndexLimits {
        IndexLimits {
            summary_max_chars: self.config.index_summary_max_chars,
            tags_max: self.config.index_tags_max,
            terms_max: self.config.index_terms_max,
        }
    }
}

/// Whether `dir` directly contains a `.json` file. A missing dir is empty.
fn dir_has_json(dir: &Path) -> Result<bool, PipelineError> {
    let Some(entries) = read_dir_if_exists(dir)? else { return Ok(false) };
    for entry in entries {
        let entry = entry.map_err(|source| PipelineError::Io { path: dir.to_path_buf(), source })?;
        let path = entry.path();
        if path.is_file()
            && path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("json"))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `dir` has any entry. A missing dir is empty.
fn dir_has_entries(dir: &Path) -> Result<bool, PipelineError> {
    Ok(read_dir_if_exists(dir)?.is_some_and(|mut entries| entries.next().is_some()))
}

fn read_dir_if_exists(dir: &Path) -> Result<Option<fs::ReadDir>, PipelineError> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Some(entries)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PipelineError::Io { path: dir.to_path_buf(), source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_and_display() {
        assert_eq!("Summarize".parse::<Stage>().unwrap(), Stage::Summarize);
        assert_eq!(Stage::Rollup.to_string(), "rollup");
        assert!("pack".parse::<Stage>().is_err());
    }

    #[test]
    fn test_selection_includes() {
        assert!(StageSelection::All.includes(Stage::Split));
        assert!(StageSelection::Only(Stage::Chunk).includes(Stage::Chunk));
        assert!(!StageSelection::Only(Stage::Chunk).includes(Stage::Summarize));

        let from = StageSelection::From(Stage::Summarize);
        let selected: Vec<Stage> = Stage::ALL.into_iter().filter(|s| from.includes(*s)).collect();
        assert_eq!(selected, vec![Stage::Summarize, Stage::Rollup]);
    }

    #[test]
    fn test_layout() {
        let layout = PipelineLayout::new("/data/run");
        assert_eq!(layout.chunks, Path::new("/data/run/threads/chunks"));
        assert_eq!(
            layout.thread_sentiment_summaries,
            Path::new("/data/run/threads/thread_sentiment_summaries")
        );
    }

    #[test]
    fn test_split_requires_input() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            out_dir: tmp.path().to_path_buf(),
            stages: StageSelection::Only(Stage::Split),
            ..PipelineConfig::default()
        };

        let err = Pipeline::new(config).run(&CancellationToken::new()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput));
    }

    #[test]
    fn test_model_stages_skip_without_collaborators() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            out_dir: tmp.path().to_path_buf(),
            stages: StageSelection::From(Stage::Summarize),
            ..PipelineConfig::default()
        };

        let report = Pipeline::new(config).run(&CancellationToken::new()).unwrap();
        assert_eq!(report.skipped, vec![Stage::Summarize, Stage::Rollup]);
    }

    #[test]
    fn test_aggregate_message_lists_every_failure() {
        let err = PipelineError::Aggregate {
            failures: vec![
                ItemFailureReport { item: "a.json".into(), error: ItemError::Cancelled },
                ItemFailureReport { item: "b.json".into(), error: ItemError::Cancelled },
            ],
        };
        let message = err.to_string();
        assert!(message.starts_with("2 item(s) failed"));
        assert!(message.contains("a.json") && message.contains("b.json"));
    }
}
