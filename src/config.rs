//! Pipeline configuration.
//!
//! Library users build [`PipelineConfig`] in code; the binary loads it
//! from `ARCHIVE_*` environment variables with [`PipelineConfig::from_env`].
//!
//! ## Environment
//!
//! | Variable | Default |
//! |----------|---------|
//! | `ARCHIVE_INPUT` | unset (required for the split stage) |
//! | `ARCHIVE_BASE_DIR` | `archive` |
//! | `ARCHIVE_ONLY_STAGE` / `ARCHIVE_FROM_STAGE` | all stages |
//! | `ARCHIVE_TARGET_TURNS` | 20 |
//! | `ARCHIVE_CONCURRENCY` | 6 |
//! | `ARCHIVE_BATCH_SIZE` | 25 (0 = one batch) |
//! | `ARCHIVE_MAX_CHUNKS` | 0 (all) |
//! | `ARCHIVE_MAX_CHUNKS_PER_THREAD` | 5 (0 disables windowing) |
//! | `ARCHIVE_INDEX_SUMMARY_MAX_CHARS` | 600 |
//! | `ARCHIVE_INDEX_TAGS_MAX` | 5 |
//! | `ARCHIVE_INDEX_TERMS_MAX` | 15 |
//! | `ARCHIVE_GLOSSARY_MAX_TERMS` | 60 (0 disables, negative = all) |
//! | `ARCHIVE_GLOSSARY_MIN_COUNT` | 2 |
//! | `ARCHIVE_RESUME` / `ARCHIVE_REINDEX` | true |
//! | `ARCHIVE_PRETTY` / `ARCHIVE_OVERWRITE` | false |
//! | `ARCHIVE_ARRAY_FIELD` | unset (auto-detect) |
//! | `ARCHIVE_ON_ERROR` | `abort` (or `skip`) |

use std::path::PathBuf;
use std::str::FromStr;

use crate::pipeline::{Stage, StageSelection, UnknownStage};
use crate::splitter::ElementErrorPolicy;

/// Error type for configuration loading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A numeric variable did not parse.
    #[error("{var} must be a number, got {value:?}")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// A boolean variable did not parse.
    #[error("{var} must be true or false, got {value:?}")]
    InvalidBool {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// A value parsed but is out of range.
    #[error("{var} is out of range: {reason}")]
    OutOfRange {
        /// Variable name.
        var: &'static str,
        /// What is wrong.
        reason: &'static str,
    },
    /// A stage name is not recognised.
    #[error(transparent)]
    UnknownStage(#[from] UnknownStage),
    /// Both only-stage and from-stage were set.
    #[error("Use only one of ARCHIVE_ONLY_STAGE or ARCHIVE_FROM_STAGE")]
    ConflictingStages,
    /// The error policy is not `abort` or `skip`.
    #[error("ARCHIVE_ON_ERROR must be abort or skip, got {0:?}")]
    InvalidPolicy(String),
}

/// Full configuration of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Archive export to split.
    pub input: Option<PathBuf>,
    /// Base output directory.
    pub out_dir: PathBuf,
    /// Stages to run.
    pub stages: StageSelection,
    /// Target turns per chunk (default: 20).
    pub target_turns_per_chunk: usize,
    /// Items in flight for model stages (default: 6).
    pub concurrency: usize,
    /// Chunks per summarize batch (default: 25, 0 = one batch).
    pub batch_size: usize,
    /// Limit on chunk files summarized.
    pub max_chunks: Option<usize>,
    /// Chunk summaries per rollup call (default: 5).
    pub max_chunks_per_thread: usize,
    /// Index summary characters (default: 600).
    pub index_summary_max_chars: usize,
    /// Index tags (default: 5).
    pub index_tags_max: usize,
    /// Index terms (default: 15).
    pub index_terms_max: usize,
    /// Glossary terms in prompts (default: 60; `None` = all).
    pub glossary_max_terms: Option<usize>,
    /// Minimum glossary count kept at the end of summarize (default: 2).
    pub glossary_min_count: u64,
    /// Skip items whose outputs exist (default: true).
    pub resume: bool,
    /// Rebuild indices after model stages (default: true).
    pub reindex: bool,
    /// Indent JSON outputs (default: false).
    pub pretty: bool,
    /// Replace existing outputs (default: false).
    pub overwrite: bool,
    /// Top-level field holding the conversations array.
    pub array_field: Option<String>,
    /// Per-conversation error policy of the split stage.
    pub on_error: ElementErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: None,
            out_dir: PathBuf::from("archive"),
            stages: StageSelection::All,
            target_turns_per_chunk: crate::DEFAULT_TARGET_TURNS_PER_CHUNK,
            concurrency: crate::pipeline::executor::DEFAULT_CONCURRENCY,
            batch_size: 25,
            max_chunks: None,
            max_chunks_per_thread: 5,
            index_summary_max_chars: 600,
            index_tags_max: 5,
            index_terms_max: 15,
            glossary_max_terms: Some(60),
            glossary_min_count: 2,
            resume: true,
            reindex: true,
            pretty: false,
            overwrite: false,
            array_field: None,
            on_error: ElementErrorPolicy::Abort,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `ARCHIVE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let stages = match (get("ARCHIVE_ONLY_STAGE"), get("ARCHIVE_FROM_STAGE")) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingStages),
            (Some(only), None) => StageSelection::Only(Stage::from_str(&only)?),
            (None, Some(from)) => StageSelection::From(Stage::from_str(&from)?),
            (None, None) => StageSelection::All,
        };

        let on_error = match get("ARCHIVE_ON_ERROR").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("abort") => ElementErrorPolicy::Abort,
            Some("skip") => ElementErrorPolicy::Skip,
            Some(other) => return Err(ConfigError::InvalidPolicy(other.to_string())),
        };

        let glossary_max_terms = match get("ARCHIVE_GLOSSARY_MAX_TERMS") {
            None => defaults.glossary_max_terms,
            Some(raw) => {
                let n: i64 = parse_number("ARCHIVE_GLOSSARY_MAX_TERMS", &raw)?;
                usize::try_from(n).ok()
            }
        };

        let target_turns_per_chunk =
            number(&get, "ARCHIVE_TARGET_TURNS", defaults.target_turns_per_chunk)?;
        if target_turns_per_chunk == 0 {
            return Err(ConfigError::OutOfRange { var: "ARCHIVE_TARGET_TURNS", reason: "must be > 0" });
        }

        let max_chunks = number(&get, "ARCHIVE_MAX_CHUNKS", 0usize)?;

        Ok(Self {
            input: get("ARCHIVE_INPUT").map(PathBuf::from),
            out_dir: get("ARCHIVE_BASE_DIR").map(PathBuf::from).unwrap_or(defaults.out_dir),
            stages,
            target_turns_per_chunk,
            concurrency: number(&get, "ARCHIVE_CONCURRENCY", defaults.concurrency)?,
            batch_size: number(&get, "ARCHIVE_BATCH_SIZE", defaults.batch_size)?,
            max_chunks: (max_chunks > 0).then_some(max_chunks),
            max_chunks_per_thread: number(
                &get,
                "ARCHIVE_MAX_CHUNKS_PER_THREAD",
                defaults.max_chunks_per_thread,
            )?,
            index_summary_max_chars: number(
                &get,
                "ARCHIVE_INDEX_SUMMARY_MAX_CHARS",
                defaults.index_summary_max_chars,
            )?,
            index_tags_max: number(&get, "ARCHIVE_INDEX_TAGS_MAX", defaults.index_tags_max)?,
            index_terms_max: number(&get, "ARCHIVE_INDEX_TERMS_MAX", defaults.index_terms_max)?,
            glossary_max_terms,
            glossary_min_count: number(&get, "ARCHIVE_GLOSSARY_MIN_COUNT", defaults.glossary_min_count)?,
            resume: flag(&get, "ARCHIVE_RESUME", defaults.resume)?,
            reindex: flag(&get, "ARCHIVE_REINDEX", defaults.reindex)?,
            pretty: flag(&get, "ARCHIVE_PRETTY", defaults.pretty)?,
            overwrite: flag(&get, "ARCHIVE_OVERWRITE", defaults.overwrite)?,
            array_field: get("ARCHIVE_ARRAY_FIELD"),
            on_error,
        })
    }
}

fn parse_number<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidNumber { var, value: raw.to_string() })
}

fn number<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => parse_number(var, &raw),
        None => Ok(default),
    }
}

fn flag<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(var) else { return Ok(default) };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { var, value: raw }),
    }
}
