//! Atomic file writes.
//!
//! Every artifact the pipeline produces goes through this module. A payload
//! is written to a temp file created in the destination directory, synced,
//! and renamed over the final path, so readers only ever observe a complete
//! file. Temp and final paths share a directory, which keeps the rename on
//! one filesystem.
//!
//! ## Overwrite Discipline
//!
//! When overwriting is disabled the existence check runs immediately before
//! the write. The check is not exclusive with the rename: every output path
//! has exactly one writer, guaranteed upstream by id-collision suffixes and
//! resume logic.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Prefix of temp files created next to their destination.
const TEMP_PREFIX: &str = ".tmp_";

/// Suffix of temp files. Never `.json`, so directory scans skip strays.
const TEMP_SUFFIX: &str = ".partial";

/// Permission bits applied to written files on unix.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Error type for atomic write operations.
#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError {
    /// The destination exists and overwriting is disabled.
    #[error("Output file already exists: {}", path.display())]
    AlreadyExists {
        /// Destination path.
        path: PathBuf,
    },
    /// The destination directory could not be created.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Writing, syncing or stat-ing failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The final rename over the destination failed.
    #[error("Failed to move temp file onto {}: {source}", path.display())]
    Persist {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The value could not be encoded as JSON.
    #[error("Failed to encode JSON for {}: {source}", path.display())]
    Serialize {
        /// Destination path.
        path: PathBuf,
        /// Underlying encoder error.
        #[source]
        source: serde_json::Error,
    },
}

impl AtomicWriteError {
    /// Whether this error is an existing-file conflict.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

/// Writer applying the overwrite and formatting policy of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtomicFileWriter {
    /// Replace existing files instead of failing.
    pub overwrite: bool,
    /// Indent JSON output with two spaces.
    pub pretty: bool,
}

impl AtomicFileWriter {
    /// Create a writer with the given policy.
    pub fn new(overwrite: bool, pretty: bool) -> Self {
        Self { overwrite, pretty }
    }

    /// Fail with `AlreadyExists` if the path exists and overwriting is off.
    pub fn ensure_writable(&self, path: &Path) -> Result<(), AtomicWriteError> {
        if self.overwrite {
            return Ok(());
        }
        match fs::metadata(path) {
            Ok(_) => Err(AtomicWriteError::AlreadyExists { path: path.to_path_buf() }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AtomicWriteError::io(path, e)),
        }
    }

    /// Encode `value` as JSON and write it atomically.
    ///
    /// Returns the number of bytes written, trailing newline included.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<u64, AtomicWriteError> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
        .map_err(|source| AtomicWriteError::Serialize { path: path.to_path_buf(), source })?;

        self.ensure_writable(path)?;
        write_atomic(path, &encoded)
    }
}

/// Write `data` plus a trailing newline to `path` atomically.
///
/// Creates missing parent directories. Always replaces an existing file;
/// callers wanting the non-overwrite check go through [`AtomicFileWriter`].
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<u64, AtomicWriteError> {
    persist(path, &[data, b"\n"])
}

/// Write newline-terminated lines to `path` atomically.
///
/// An empty slice produces an empty file.
pub fn write_lines_atomic(path: &Path, lines: &[String]) -> Result<u64, AtomicWriteError> {
    let mut payload = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
    }
    persist(path, &[&payload])
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn persist(path: &Path, pieces: &[&[u8]]) -> Result<u64, AtomicWriteError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)
        .map_err(|source| AtomicWriteError::CreateDir { path: dir.to_path_buf(), source })?;

    // Dropping the handle before `persist` removes the temp file.
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| AtomicWriteError::io(path, e))?;

    let mut written = 0u64;
    for piece in pieces {
        tmp.write_all(piece).map_err(|e| AtomicWriteError::io(path, e))?;
        written += piece.len() as u64;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(DEFAULT_FILE_MODE))
            .map_err(|e| AtomicWriteError::io(path, e))?;
    }

    tmp.as_file().sync_all().map_err(|e| AtomicWriteError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| AtomicWriteError::Persist { path: path.to_path_buf(), source: e.error })?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_json_appends_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");

        let n = AtomicFileWriter::default()
            .write_json(&path, &json!({"a": 1}))
            .unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\"a\":1}\n");
        assert_eq!(n, written.len() as u64);
    }

    #[test]
    fn test_pretty_uses_two_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");

        AtomicFileWriter::new(false, true)
            .write_json(&path, &json!({"a": 1}))
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\n  \"a\": 1\n}\n");
    }

    #[test]
    fn test_refuses_overwrite_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        fs::write(&path, "old").unwrap();

        let err = AtomicFileWriter::default()
            .write_json(&path, &json!([]))
            .unwrap_err();

        assert!(err.is_already_exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        fs::write(&path, "old").unwrap();

        AtomicFileWriter::new(true, false)
            .write_json(&path, &json!([1]))
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]\n");
    }

    #[test]
    fn test_creates_parent_dirs_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("out.json");

        write_atomic(&path, b"{}").unwrap();

        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["out.json".to_string()]);
    }

    #[test]
    fn test_write_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");

        write_lines_atomic(&path, &["{}".to_string(), "[]".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}\n[]\n");

        write_lines_atomic(&path, &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");

        write_atomic(&path, b"{}").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DEFAULT_FILE_MODE);
    }
}
