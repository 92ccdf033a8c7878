use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use walkdir::WalkDir;

/// A file the walker produced, with the attributes the pipeline filters on
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub path: PathBuf,
    /// Lower-cased extension including the leading period, empty if none
    pub extension: String,
    /// Creation time where the platform records it, modification time otherwise
    pub timestamp: DateTime<Utc>,
}

impl Candidate {
    /// Stat a path into a candidate
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(path, &metadata))
    }

    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Self {
        let time = metadata.created().or_else(|_| metadata.modified()).ok();

        Self {
            path: path.to_path_buf(),
            extension: extension_of(path),
            timestamp: timestamp_or_now(path, time, Utc::now()),
        }
    }

    /// File name without the extension
    pub fn name_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A file without a readable timestamp counts as brand new, so it waits out
/// the full delay instead of becoming eligible at once
pub fn timestamp_or_now(path: &Path, time: Option<SystemTime>, now: DateTime<Utc>) -> DateTime<Utc> {
    match time {
        Some(time) => DateTime::<Utc>::from(time),
        None => {
            warn!("No creation or modification time for {}, treating it as new", path.display());
            now
        }
    }
}

/// Lower-cased extension with a leading period, or the empty string
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| format!(".{}", s.to_lowercase()))
        .unwrap_or_default()
}

/// Lazily walk `root` in file-name order, yielding regular files.
///
/// Directories listed in `excluded` (the scratch and trash directories when
/// they live inside the library) are not descended into.
pub fn walk(root: &Path, excluded: Vec<PathBuf>) -> impl Iterator<Item = PathBuf> {
    let mut entry_count: u64 = 0;
    let root_display = root.display().to_string();

    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            let skip = entry.depth() > 0 && excluded.iter().any(|x| x == entry.path());
            if skip {
                debug!("Not descending into {}", entry.path().display());
            }
            !skip
        })
        .filter_map(move |entry| {
            entry_count += 1;
            if entry_count % 1000 == 0 {
                debug!("Walked {} entries so far in {}...", entry_count, root_display);
            }
            match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    None
                }
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
}
