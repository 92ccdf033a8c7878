//! Checkpoint ledger: which files were already evaluated or replaced.
//!
//! Both logs are append-only text files, one absolute path per line. Membership
//! ignores the extension so a file that came back from the transcoder with a
//! different container is still recognised.

use std::borrow::Cow;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A ledger or report file could not be read or written
#[derive(Debug, Error)]
#[error("ledger file {path}: {source}")]
pub struct LedgerError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Path with its extension removed; the dedup key of the ledger
pub fn stem(path: &Path) -> PathBuf {
    path.with_extension("")
}

/// Raw bytes of a path as written to a ledger line. Lossless on unix, where
/// file names need not be UTF-8.
#[cfg(unix)]
pub fn path_to_bytes(path: &Path) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
pub fn path_to_bytes(path: &Path) -> Cow<'_, [u8]> {
    match path.to_string_lossy() {
        Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
        Cow::Owned(s) => Cow::Owned(s.into_bytes()),
    }
}

/// Inverse of [`path_to_bytes`]
#[cfg(unix)]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Append-only line log that is flushed to disk before each append returns
#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file if it does not exist, leaving existing content alone
    pub fn touch(&self) -> Result<(), LedgerError> {
        self.open().map(|_| ())
    }

    pub fn append(&self, line: &str) -> Result<(), LedgerError> {
        self.append_bytes(line.as_bytes())
    }

    /// Append one path, byte for byte
    pub fn append_path(&self, path: &Path) -> Result<(), LedgerError> {
        self.append_bytes(&path_to_bytes(path))
    }

    fn append_bytes(&self, line: &[u8]) -> Result<(), LedgerError> {
        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line);
        record.push(b'\n');

        let mut file = self.open()?;
        file.write_all(&record)
            .and_then(|_| file.sync_data())
            .map_err(|source| self.error(source))
    }

    /// Every path currently in the log; a missing file reads as empty
    pub fn paths(&self) -> Result<Vec<PathBuf>, LedgerError> {
        match fs::read(&self.path) {
            Ok(content) => Ok(content
                .split(|b| *b == b'\n')
                .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
                .filter(|line| !line.is_empty())
                .map(path_from_bytes)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(self.error(source)),
        }
    }

    fn open(&self) -> Result<File, LedgerError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.error(source))
    }

    fn error(&self, source: io::Error) -> LedgerError {
        LedgerError {
            path: self.path.clone(),
            source,
        }
    }
}

/// Persistent record of evaluated and replaced files
pub trait Ledger {
    /// True when a path with the same stem was already evaluated
    fn is_checked(&self, path: &Path) -> bool;

    /// Durably record that a file was evaluated
    fn mark_checked(&mut self, path: &Path) -> Result<(), LedgerError>;

    /// Durably record that a file was replaced by its transcoded version
    fn mark_transcoded(&mut self, path: &Path) -> Result<(), LedgerError>;
}

/// Ledger backed by the checked and transcoded log files
#[derive(Debug)]
pub struct FileLedger {
    checked: AppendLog,
    transcoded: AppendLog,
    stems: HashSet<PathBuf>,
}

impl FileLedger {
    /// Open both logs, creating the checked log if needed, and load its stems
    pub fn open(checked_path: &Path, transcoded_path: &Path) -> Result<Self, LedgerError> {
        let checked = AppendLog::new(checked_path);
        checked.touch()?;
        let stems = checked.paths()?.iter().map(|p| stem(p)).collect();

        Ok(Self {
            checked,
            transcoded: AppendLog::new(transcoded_path),
            stems,
        })
    }

    /// Number of distinct stems in the checked log
    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }
}

impl Ledger for FileLedger {
    fn is_checked(&self, path: &Path) -> bool {
        self.stems.contains(&stem(path))
    }

    fn mark_checked(&mut self, path: &Path) -> Result<(), LedgerError> {
        self.checked.append_path(path)?;
        self.stems.insert(stem(path));
        Ok(())
    }

    fn mark_transcoded(&mut self, path: &Path) -> Result<(), LedgerError> {
        self.transcoded.append_path(path)
    }
}

/// In-memory ledger with the same semantics, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryLedger {
    pub checked: Vec<PathBuf>,
    pub transcoded: Vec<PathBuf>,
}

impl Ledger for MemoryLedger {
    fn is_checked(&self, path: &Path) -> bool {
        let key = stem(path);
        self.checked.iter().any(|p| stem(p) == key)
    }

    fn mark_checked(&mut self, path: &Path) -> Result<(), LedgerError> {
        self.checked.push(path.to_path_buf());
        Ok(())
    }

    fn mark_transcoded(&mut self, path: &Path) -> Result<(), LedgerError> {
        self.transcoded.push(path.to_path_buf());
        Ok(())
    }
}
