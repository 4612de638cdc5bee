//! Run glossary: a persisted term table shared across summarize batches.
//!
//! The glossary has a single owner. Workers only read the prompt excerpt
//! computed before their batch starts; additions are merged after every
//! worker of the batch has joined, then the file is rewritten atomically.
//!
//! ## Merge Rules
//!
//! - Key is the trimmed, lowercased term; empty keys are ignored
//! - A key repeated within one batch counts once
//! - Existing entries: count + 1, first-seen set only when unset,
//!   last-seen always updated, the longer non-empty definition wins
//! - Entries are kept sorted by count descending, then key ascending

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic::{AtomicFileWriter, AtomicWriteError};
use crate::types::{null_as_default, GlossaryAddition};

/// Current on-disk glossary version.
pub const GLOSSARY_VERSION: u32 = 1;

/// Error type for glossary persistence.
#[derive(Debug, thiserror::Error)]
pub enum GlossaryError {
    /// The glossary file exists but could not be read.
    #[error("Failed to read glossary {}: {source}", path.display())]
    Read {
        /// Glossary path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The glossary file is not valid glossary JSON.
    #[error("Failed to parse glossary {}: {source}", path.display())]
    Parse {
        /// Glossary path.
        path: PathBuf,
        /// Underlying decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// Saving the glossary failed.
    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

/// One glossary term.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    /// Term as first seen (trimmed).
    #[serde(default, deserialize_with = "null_as_default")]
    pub term: String,
    /// Best known definition.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub definition: String,
    /// Number of batches that referenced the term.
    #[serde(default)]
    pub count: u64,
    /// Earliest thread start that referenced the term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<f64>,
    /// Latest thread start that referenced the term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<f64>,
}

impl GlossaryEntry {
    fn key(&self) -> String {
        normalize_key(&self.term)
    }
}

/// The run glossary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Glossary {
    /// Format version.
    #[serde(default)]
    pub version: u32,
    /// Entries, most frequent first.
    #[serde(default, deserialize_with = "null_as_default")]
    pub entries: Vec<GlossaryEntry>,
    /// Free-form metadata preserved across saves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Default for Glossary {
    fn default() -> Self {
        Self {
            version: GLOSSARY_VERSION,
            entries: Vec::new(),
            meta: None,
        }
    }
}

impl Glossary {
    /// Create an empty glossary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a glossary; a missing file yields an empty one.
    pub fn load(path: &Path) -> Result<Self, GlossaryError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(GlossaryError::Read { path: path.to_path_buf(), source });
            }
        };

        let mut glossary: Self = serde_json::from_slice(&bytes)
            .map_err(|source| GlossaryError::Parse { path: path.to_path_buf(), source })?;
        if glossary.version == 0 {
            glossary.version = GLOSSARY_VERSION;
        }
        Ok(glossary)
    }

    /// Save as pretty JSON, atomically replacing any previous file.
    pub fn save(&self, path: &Path) -> Result<(), GlossaryError> {
        AtomicFileWriter::new(true, true).write_json(path, self)?;
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the glossary has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by term, case-insensitively.
    pub fn get(&self, term: &str) -> Option<&GlossaryEntry> {
        let key = normalize_key(term);
        self.entries.iter().find(|e| e.key() == key)
    }

    /// Merge one batch of additions seen at `seen_at`.
    ///
    /// Returns the sorted keys touched by this merge.
    pub fn merge(&mut self, additions: &[GlossaryAddition], seen_at: Option<f64>) -> Vec<String> {
        let mut index: HashMap<String, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key(), i))
            .collect();

        let mut batch_seen: HashSet<String> = HashSet::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for addition in additions {
            let key = normalize_key(&addition.term);
            if key.is_empty() || !batch_seen.insert(key.clone()) {
                continue;
            }
            let definition = addition.definition.trim();

            match index.get(&key) {
                Some(&i) => {
                    let entry = &mut self.entries[i];
                    entry.count += 1;
                    if entry.first_seen_at.is_none() {
                        entry.first_seen_at = seen_at;
                    }
                    entry.last_seen_at = seen_at;
                    if !definition.is_empty() && definition.len() > entry.definition.len() {
                        entry.definition = definition.to_string();
                    }
                }
                None => {
                    index.insert(key.clone(), self.entries.len());
                    self.entries.push(GlossaryEntry {
                        term: addition.term.trim().to_string(),
                        definition: definition.to_string(),
                        count: 1,
                        first_seen_at: seen_at,
                        last_seen_at: seen_at,
                    });
                }
            }
            touched.insert(key);
        }

        self.sort_entries();
        touched.into_iter().collect()
    }

    /// Drop entries seen fewer than `min_count` times.
    ///
    /// A `min_count` of 0 or 1 keeps everything. Returns the number removed.
    pub fn cull(&mut self, min_count: u64) -> usize {
        if min_count <= 1 {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|e| e.count >= min_count);
        before - self.entries.len()
    }

    /// Render entries with a definition as `- term: definition` lines.
    ///
    /// `Some(0)` disables the excerpt; `None` includes every entry.
    pub fn prompt_excerpt(&self, max_terms: Option<usize>) -> String {
        let limit = match max_terms {
            Some(0) => return String::new(),
            Some(n) => n,
            None => usize::MAX,
        };

        let mut out = String::new();
        for entry in self.entries.iter().take(limit) {
            let term = entry.term.trim();
            let definition = entry.definition.trim();
            if term.is_empty() || definition.is_empty() {
                continue;
            }
            out.push_str("- ");
            out.push_str(term);
            out.push_str(": ");
            out.push_str(definition);
            out.push('\n');
        }
        out
    }

    fn sort_entries(&mut self) {
        self.entries
            .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key().cmp(&b.key())));
    }
}

fn normalize_key(term: &str) -> String {
    term.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(term: &str, definition: &str) -> GlossaryAddition {
        GlossaryAddition { term: term.into(), definition: definition.into() }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let glossary = Glossary::load(&dir.path().join("glossary.json")).unwrap();
        assert_eq!(glossary.version, GLOSSARY_VERSION);
        assert!(glossary.is_empty());
    }

    #[test]
    fn test_version_zero_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glossary.json");
        fs::write(&path, r#"{"entries":[{"term":"x","count":2}]}"#).unwrap();

        let glossary = Glossary::load(&path).unwrap();
        assert_eq!(glossary.version, 1);
        assert_eq!(glossary.entries[0].count, 2);
    }

    #[test]
    fn test_merge_counts_once_per_batch() {
        let mut glossary = Glossary::new();
        let touched = glossary.merge(
            &[add("Kernel", ""), add(" kernel ", "core"), add("", "ignored")],
            Some(10.0),
        );

        assert_eq!(touched, vec!["kernel".to_string()]);
        assert_eq!(glossary.len(), 1);
        let entry = glossary.get("KERNEL").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.term, "Kernel");
        assert_eq!(entry.first_seen_at, Some(10.0));
    }

    #[test]
    fn test_merge_updates_existing_entry() {
        let mut glossary = Glossary::new();
        glossary.merge(&[add("slice", "short")], None);
        glossary.merge(&[add("Slice", "a longer definition")], Some(5.0));
        glossary.merge(&[add("slice", "tiny")], Some(9.0));

        let entry = glossary.get("slice").unwrap();
        assert_eq!(entry.count, 3);
        assert_eq!(entry.definition, "a longer definition");
        assert_eq!(entry.first_seen_at, Some(5.0));
        assert_eq!(entry.last_seen_at, Some(9.0));
    }

    #[test]
    fn test_entries_sorted_by_count_then_key() {
        let mut glossary = Glossary::new();
        glossary.merge(&[add("beta", ""), add("alpha", ""), add("gamma", "")], None);
        glossary.merge(&[add("gamma", "")], None);

        let terms: Vec<&str> = glossary.entries.iter().map(|e| e.term.as_str()).collect();
        assert_eq!(terms, vec!["gamma", "alpha", "beta"]);
    }

    #[test]
    fn test_cull_and_excerpt() {
        let mut glossary = Glossary::new();
        glossary.merge(&[add("a", "first"), add("b", "")], None);
        glossary.merge(&[add("a", "")], None);

        assert_eq!(glossary.prompt_excerpt(None), "- a: first\n");
        assert_eq!(glossary.prompt_excerpt(Some(0)), "");

        assert_eq!(glossary.cull(1), 0);
        assert_eq!(glossary.cull(2), 1);
        assert_eq!(glossary.len(), 1);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/glossary.json");
        let mut glossary = Glossary::new();
        glossary.merge(&[add("term", "def")], Some(1.0));

        glossary.save(&path).unwrap();
        assert_eq!(Glossary::load(&path).unwrap(), glossary);
    }
}
