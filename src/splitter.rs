//! Streaming archive splitter.
//!
//! Turns one export file into one simplified thread file per conversation
//! without materializing the archive. The top level is driven through a
//! serde [`Visitor`]: only the conversations array is visited element by
//! element, and every other object field is skipped structurally with
//! [`IgnoredAny`]. At most one conversation element is held in memory.
//!
//! ## Accepted Top Levels
//!
//! - an array of conversation objects
//! - an object whose named array field holds the conversations
//! - an object whose first array-valued field holds the conversations
//!   (when no field name is configured)
//!
//! ## Output Naming
//!
//! Files are named after the sanitized conversation id. Ids that sanitize
//! to the same name get `-2`, `-3`, ... suffixes in arrival order.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::de::{self, DeserializeSeed, Deserializer as _, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;

use crate::atomic::{AtomicFileWriter, AtomicWriteError};
use tokio_util::sync::CancellationToken;
use crate::linearizer::{linearize, LinearizeError};
use crate::types::{RawConversation, SimplifiedConversation};

/// Read buffer for the export file.
const READ_BUFFER_BYTES: usize = 1 << 20;

/// File stem used when an id sanitizes to nothing.
const FALLBACK_STEM: &str = "thread";

/// Error type for archive splitting.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// The export file could not be opened.
    #[error("Failed to open archive {}: {source}", path.display())]
    Open {
        /// Export path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The output directory could not be created.
    #[error("Failed to create output directory {}: {source}", path.display())]
    OutputDir {
        /// Output directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The export is not valid JSON or ends with trailing data.
    #[error("Malformed archive JSON: {0}")]
    Decode(#[source] serde_json::Error),
    /// The top-level value is neither an array nor an object.
    #[error("Top-level JSON value must be an array or an object")]
    MalformedTopLevel,
    /// The configured array field holds something else.
    #[error("Field {field:?} is not an array")]
    ArrayFieldNotArray {
        /// Configured field name.
        field: String,
    },
    /// No conversations array was found in a top-level object.
    #[error("No conversations array found at the top level")]
    NoConversationsArray,
    /// An element has neither `conversation_id` nor `id`.
    #[error("Conversation at index {index} has no conversation_id or id")]
    MissingId {
        /// Element position in the conversations array.
        index: usize,
    },
    /// An element's message graph could not be linearized.
    #[error("Failed to linearize conversation {id}: {source}")]
    Linearize {
        /// Conversation id.
        id: String,
        /// Linearizer failure.
        #[source]
        source: LinearizeError,
    },
    /// An element does not have the shape of a conversation.
    #[error("Conversation at index {index} is malformed: {source}")]
    Element {
        /// Element position in the conversations array.
        index: usize,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// Writing a thread file failed.
    #[error("Failed to write thread {id}: {source}")]
    Write {
        /// Conversation id.
        id: String,
        /// Writer failure.
        #[source]
        source: AtomicWriteError,
    },
    /// The run was cancelled between elements.
    #[error("Split cancelled")]
    Cancelled,
}

impl SplitError {
    /// Whether the error is confined to one conversation element.
    pub fn is_element_scoped(&self) -> bool {
        matches!(
            self,
            Self::MissingId { .. } | Self::Linearize { .. } | Self::Element { .. }
        )
    }
}

/// What to do with a conversation that fails structurally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ElementErrorPolicy {
    /// Fail the whole run, so a successful run has a complete output set.
    #[default]
    Abort,
    /// Log the failure, record it in [`SplitResult::skipped`] and continue.
    Skip,
}

/// Options for one split run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitOptions {
    /// Top-level object field holding the conversations. `None` picks the
    /// first array-valued field.
    pub array_field: Option<String>,
    /// Replace existing thread files.
    pub overwrite: bool,
    /// Indent output JSON.
    pub pretty: bool,
    /// Handling of element-scoped failures.
    pub on_error: ElementErrorPolicy,
}

/// A conversation left out under [`ElementErrorPolicy::Skip`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedConversation {
    /// Element position in the conversations array.
    pub index: usize,
    /// Conversation id, when it could be read.
    pub conversation_id: Option<String>,
    /// Failure description.
    pub reason: String,
}

/// Outcome of a split run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitResult {
    /// Thread files written.
    pub threads_written: usize,
    /// Bytes written across all thread files.
    pub bytes_written: u64,
    /// Elements skipped under the skip policy.
    pub skipped: Vec<SkippedConversation>,
}

/// Splits an export into per-thread files.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSplitter {
    options: SplitOptions,
}

impl ArchiveSplitter {
    /// Create a splitter with the given options.
    pub fn new(options: SplitOptions) -> Self {
        Self { options }
    }

    /// Options in effect.
    pub fn options(&self) -> &SplitOptions {
        &self.options
    }

    /// Split the export at `input` into `out_dir`.
    pub fn split(
        &self,
        input: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SplitResult, SplitError> {
        let file = File::open(input)
            .map_err(|source| SplitError::Open { path: input.to_path_buf(), source })?;
        let reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);

        let result = self.split_reader(reader, out_dir, cancel)?;
        tracing::info!(
            input = %input.display(),
            out_dir = %out_dir.display(),
            threads_written = result.threads_written,
            bytes_written = result.bytes_written,
            skipped = result.skipped.len(),
            "Archive split complete"
        );
        Ok(result)
    }

    /// Split an export read from `reader` into `out_dir`.
    pub fn split_reader<R: Read>(
        &self,
        reader: R,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SplitResult, SplitError> {
        fs::create_dir_all(out_dir)
            .map_err(|source| SplitError::OutputDir { path: out_dir.to_path_buf(), source })?;

        let mut sink = ElementSink {
            out_dir,
            writer: AtomicFileWriter::new(self.options.overwrite, self.options.pretty),
            policy: self.options.on_error,
            cancel,
            used_names: HashSet::new(),
            next_index: 0,
            result: SplitResult::default(),
            failure: None,
        };

        let mut stream = serde_json::Deserializer::from_reader(reader);
        let visited = (&mut stream).deserialize_any(TopLevelVisitor {
            sink: &mut sink,
            array_field: self.options.array_field.as_deref(),
        });

        if let Some(failure) = sink.failure.take() {
            return Err(failure);
        }
        match visited.map_err(SplitError::Decode)? {
            TopLevel::Conversations => {}
            TopLevel::NoArray => return Err(SplitError::NoConversationsArray),
            TopLevel::NotContainer => return Err(SplitError::MalformedTopLevel),
        }
        stream.end().map_err(SplitError::Decode)?;

        Ok(sink.result)
    }
}

/// Sanitize a conversation id into a file stem.
///
/// Keeps letters, digits, `-`, `_` and `.`, then strips leading dots. An
/// empty result becomes `thread`.
pub fn sanitize_filename_component(id: &str) -> String {
    let kept: String = id
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let stem = kept.trim_start_matches('.');
    if stem.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        stem.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Element handling
// ─────────────────────────────────────────────────────────────────────────────

struct ElementSink<'a> {
    out_dir: &'a Path,
    writer: AtomicFileWriter,
    policy: ElementErrorPolicy,
    cancel: &'a CancellationToken,
    used_names: HashSet<String>,
    next_index: usize,
    result: SplitResult,
    /// First fatal error; takes precedence over the decoder error it causes.
    failure: Option<SplitError>,
}

impl ElementSink<'_> {
    fn accept(&mut self, element: serde_json::Value) -> Result<(), SplitError> {
        if self.cancel.is_cancelled() {
            return Err(SplitError::Cancelled);
        }
        let index = self.next_index;
        self.next_index += 1;

        let hinted_id = id_hint(&element);
        match self.write_element(index, element) {
            Ok(bytes) => {
                self.result.threads_written += 1;
                self.result.bytes_written += bytes;
                Ok(())
            }
            Err(e) if e.is_element_scoped() && self.policy == ElementErrorPolicy::Skip => {
                tracing::warn!(
                    index,
                    conversation_id = hinted_id.as_deref().unwrap_or(""),
                    error = %e,
                    "Skipping malformed conversation"
                );
                self.result.skipped.push(SkippedConversation {
                    index,
                    conversation_id: hinted_id,
                    reason: e.to_string(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn write_element(&mut self, index: usize, element: serde_json::Value) -> Result<u64, SplitError> {
        let raw = RawConversation::deserialize(element)
            .map_err(|source| SplitError::Element { index, source })?;

        let id = conversation_id(&raw).ok_or(SplitError::MissingId { index })?;
        let messages = linearize(&raw.mapping, &raw.current_node)
            .map_err(|source| SplitError::Linearize { id: id.clone(), source })?;

        let thread = SimplifiedConversation {
            conversation_id: id.clone(),
            title: raw.title,
            create_time: raw.create_time,
            update_time: raw.update_time,
            messages,
        };

        let path = self.out_dir.join(format!("{}.json", self.claim_name(&id)));
        tracing::debug!(
            conversation_id = %id,
            path = %path.display(),
            messages = thread.messages.len(),
            "Writing thread"
        );
        self.writer
            .write_json(&path, &thread)
            .map_err(|source| SplitError::Write { id, source })
    }

    fn claim_name(&mut self, id: &str) -> String {
        let base = sanitize_filename_component(id);
        let mut name = base.clone();
        let mut suffix = 2;
        while self.used_names.contains(&name) {
            name = format!("{base}-{suffix}");
            suffix += 1;
        }
        self.used_names.insert(name.clone());
        name
    }

    fn abort<E: de::Error>(&mut self, failure: SplitError) -> E {
        let message = failure.to_string();
        self.failure = Some(failure);
        E::custom(message)
    }
}

/// First non-blank id, kept verbatim; only the file name is sanitized.
fn conversation_id(raw: &RawConversation) -> Option<String> {
    [&raw.conversation_id, &raw.id]
        .into_iter()
        .find(|s| !s.trim().is_empty())
        .cloned()
}

fn id_hint(element: &serde_json::Value) -> Option<String> {
    ["conversation_id", "id"]
        .into_iter()
        .filter_map(|k| element.get(k).and_then(serde_json::Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn drain_conversations<'de, A: SeqAccess<'de>>(
    sink: &mut ElementSink<'_>,
    mut seq: A,
) -> Result<(), A::Error> {
    while let Some(element) = seq.next_element::<serde_json::Value>()? {
        if let Err(failure) = sink.accept(element) {
            return Err(sink.abort(failure));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Top-level visitors
// ─────────────────────────────────────────────────────────────────────────────

enum TopLevel {
    Conversations,
    NoArray,
    NotContainer,
}

struct TopLevelVisitor<'s, 'a> {
    sink: &'s mut ElementSink<'a>,
    array_field: Option<&'s str>,
}

impl<'de> Visitor<'de> for TopLevelVisitor<'_, '_> {
    type Value = TopLevel;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON array of conversations or an object holding one")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<TopLevel, A::Error> {
        drain_conversations(self.sink, seq)?;
        Ok(TopLevel::Conversations)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<TopLevel, A::Error> {
        let mut found = false;

        while let Some(key) = map.next_key::<String>()? {
            let wanted = !found && self.array_field.map_or(true, |f| f == key);
            if !wanted {
                map.next_value::<IgnoredAny>()?;
                continue;
            }

            let was_array = map.next_value_seed(ArraySeed { sink: &mut *self.sink })?;
            if was_array {
                found = true;
            } else if self.array_field.is_some() {
                return Err(self.sink.abort(SplitError::ArrayFieldNotArray { field: key }));
            }
        }

        Ok(if found { TopLevel::Conversations } else { TopLevel::NoArray })
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<TopLevel, E> {
        Ok(TopLevel::NotContainer)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<TopLevel, E> {
        Ok(TopLevel::NotContainer)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<TopLevel, E> {
        Ok(TopLevel::NotContainer)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<TopLevel, E> {
        Ok(TopLevel::NotContainer)
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<TopLevel, E> {
        Ok(TopLevel::NotContainer)
    }

    fn visit_unit<E: de::Error>(self) -> Result<TopLevel, E> {
        Ok(TopLevel::NotContainer)
    }
}

/// Visits one object field value. Arrays are drained into the sink; any
/// other value is skipped and reported as `false`.
struct ArraySeed<'s, 'a> {
    sink: &'s mut ElementSink<'a>,
}

impl<'de> DeserializeSeed<'de> for ArraySeed<'_, '_> {
    type Value = bool;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<bool, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ArraySeed<'_, '_> {
    type Value = bool;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<bool, A::Error> {
        drain_conversations(self.sink, seq)?;
        Ok(true)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<bool, A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(false)
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<bool, E> {
        Ok(false)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<bool, E> {
        Ok(false)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<bool, E> {
        Ok(false)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<bool, E> {
        Ok(false)
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<bool, E> {
        Ok(false)
    }

    fn visit_unit<E: de::Error>(self) -> Result<bool, E> {
        Ok(false)
    }
}
