//! Crash guard: the RUNNING marker file.
//!
//! The marker exists for the whole run. While a file is being transcoded it
//! holds that file's path, otherwise it is empty. A marker found at startup
//! means another run is active or a previous one died; both need an operator.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use log::error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("{marker} is present (busy with: {busy_with}); another run is active or a previous run crashed, remove it once resolved")]
    AlreadyRunning { marker: PathBuf, busy_with: String },

    #[error("crash guard marker {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Single-slot marker of the file currently being transcoded
pub trait CrashGuard {
    /// Claim the marker for this run, refusing if one already exists
    fn acquire(&self) -> Result<(), GuardError>;

    /// Record the file whose custody is in progress
    fn mark_busy(&self, path: &Path) -> Result<(), GuardError>;

    /// Return to idle
    fn clear_busy(&self) -> Result<(), GuardError>;

    /// Remove the marker at the end of a clean run
    fn release(&self) -> Result<(), GuardError>;
}

/// Marks a file busy for as long as the slot is alive
pub struct BusySlot<'a> {
    guard: &'a dyn CrashGuard,
}

impl<'a> BusySlot<'a> {
    pub fn new(guard: &'a dyn CrashGuard, path: &Path) -> Result<Self, GuardError> {
        guard.mark_busy(path)?;
        Ok(Self { guard })
    }
}

impl Drop for BusySlot<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.guard.clear_busy() {
            error!("Failed to clear crash guard: {}", e);
        }
    }
}

/// Run `work` while holding the guard.
///
/// Nothing runs if the guard cannot be acquired. The marker is released only
/// when `work` succeeds; a failed run leaves it for the operator.
pub fn with_guard<T, E, F>(guard: &dyn CrashGuard, work: F) -> Result<T, E>
where
    E: From<GuardError>,
    F: FnOnce() -> Result<T, E>,
{
    guard.acquire()?;
    match work() {
        Ok(value) => {
            guard.release()?;
            Ok(value)
        }
        Err(e) => {
            error!("Run aborted, leaving the crash guard marker in place");
            Err(e)
        }
    }
}

/// Crash guard backed by a marker file
#[derive(Debug, Clone)]
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, content: &str) -> Result<(), GuardError> {
        let result = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .and_then(|mut file| {
                file.write_all(content.as_bytes())?;
                file.sync_data()
            });
        result.map_err(|source| self.error(source))
    }

    fn error(&self, source: io::Error) -> GuardError {
        GuardError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CrashGuard for MarkerFile {
    fn acquire(&self) -> Result<(), GuardError> {
        // create_new fails if the marker exists, so two racing runs cannot both win
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file.sync_data().map_err(|source| self.error(source)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let busy_with = fs::read_to_string(&self.path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                Err(GuardError::AlreadyRunning {
                    marker: self.path.clone(),
                    busy_with: if busy_with.is_empty() {
                        "nothing".to_string()
                    } else {
                        busy_with
                    },
                })
            }
            Err(source) => Err(self.error(source)),
        }
    }

    fn mark_busy(&self, path: &Path) -> Result<(), GuardError> {
        self.write(&format!("{}\n", path.display()))
    }

    fn clear_busy(&self) -> Result<(), GuardError> {
        self.write("")
    }

    fn release(&self) -> Result<(), GuardError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.error(source)),
        }
    }
}

/// Observable state of a [`MemoryGuard`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryGuardState {
    pub present: bool,
    pub busy: Option<PathBuf>,
    /// Every path ever marked busy, in order
    pub history: Vec<PathBuf>,
}

/// In-memory crash guard for tests
#[derive(Debug, Default)]
pub struct MemoryGuard {
    state: Mutex<MemoryGuardState>,
}

impl MemoryGuard {
    /// A guard whose marker was left behind by an earlier run
    pub fn stale(busy: &Path) -> Self {
        Self {
            state: Mutex::new(MemoryGuardState {
                present: true,
                busy: Some(busy.to_path_buf()),
                history: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> MemoryGuardState {
        self.with(|s| s.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryGuardState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }
}

impl CrashGuard for MemoryGuard {
    fn acquire(&self) -> Result<(), GuardError> {
        self.with(|s| {
            if s.present {
                return Err(GuardError::AlreadyRunning {
                    marker: PathBuf::from("<memory>"),
                    busy_with: s
                        .busy
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "nothing".to_string()),
                });
            }
            s.present = true;
            Ok(())
        })
    }

    fn mark_busy(&self, path: &Path) -> Result<(), GuardError> {
        self.with(|s| {
            s.present = true;
            s.busy = Some(path.to_path_buf());
            s.history.push(path.to_path_buf());
        });
        Ok(())
    }

    fn clear_busy(&self) -> Result<(), GuardError> {
        self.with(|s| s.busy = None);
        Ok(())
    }

    fn release(&self) -> Result<(), GuardError> {
        self.with(|s| {
            s.present = false;
            s.busy = None;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_empty_marker() {
        let dir = TempDir::new().unwrap();
        let guard = MarkerFile::new(dir.path().join("RUNNING"));

        guard.acquire().unwrap();

        assert_eq!(fs::read_to_string(guard.path()).unwrap(), "");
    }

    #[test]
    fn test_acquire_refuses_existing_marker() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("RUNNING");
        fs::write(&marker, "/lib/movie.mkv\n").unwrap();

        let err = MarkerFile::new(&marker).acquire().unwrap_err();
        match err {
            GuardError::AlreadyRunning { busy_with, .. } => {
                assert_eq!(busy_with, "/lib/movie.mkv")
            }
            other => panic!("unexpected error: {}", other),
        }
        // The stale marker is left for the operator
        assert_eq!(fs::read_to_string(&marker).unwrap(), "/lib/movie.mkv\n");
    }

    #[test]
    fn test_second_acquire_refuses_empty_marker() {
        let dir = TempDir::new().unwrap();
        let guard = MarkerFile::new(dir.path().join("RUNNING"));
        guard.acquire().unwrap();

        let err = guard.acquire().unwrap_err();
        assert!(matches!(err, GuardError::AlreadyRunning { ref busy_with, .. } if busy_with == "nothing"));
    }

    #[test]
    fn test_busy_cycle_and_release() {
        let dir = TempDir::new().unwrap();
        let guard = MarkerFile::new(dir.path().join("RUNNING"));
        guard.acquire().unwrap();

        guard.mark_busy(Path::new("/lib/a.mkv")).unwrap();
        assert_eq!(fs::read_to_string(guard.path()).unwrap(), "/lib/a.mkv\n");

        guard.clear_busy().unwrap();
        assert_eq!(fs::read_to_string(guard.path()).unwrap(), "");

        guard.release().unwrap();
        assert!(!guard.path().exists());
        guard.release().unwrap();
    }

    #[test]
    fn test_busy_slot_clears_on_drop() {
        let dir = TempDir::new().unwrap();
        let guard = MarkerFile::new(dir.path().join("RUNNING"));
        guard.acquire().unwrap();

        {
            let _slot = BusySlot::new(&guard, Path::new("/lib/b.mkv")).unwrap();
            assert_eq!(fs::read_to_string(guard.path()).unwrap(), "/lib/b.mkv\n");
        }

        assert_eq!(fs::read_to_string(guard.path()).unwrap(), "");
        assert!(guard.path().exists());
    }

    #[test]
    fn test_memory_guard_state_machine() {
        let guard = MemoryGuard::default();
        guard.acquire().unwrap();
        {
            let _slot = BusySlot::new(&guard, Path::new("/x.mkv")).unwrap();
            assert_eq!(guard.state().busy, Some(PathBuf::from("/x.mkv")));
        }
        assert_eq!(guard.state().busy, None);
        assert!(guard.acquire().is_err());
        guard.release().unwrap();
        assert!(!guard.state().present);
        assert_eq!(guard.state().history, vec![PathBuf::from("/x.mkv")]);
    }

    #[test]
    fn test_with_guard_never_runs_work_over_existing_marker() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("RUNNING");
        fs::write(&marker, "/lib/movie.mkv\n").unwrap();
        let guard = MarkerFile::new(&marker);
        let mut ran = false;

        let result: Result<(), GuardError> = with_guard(&guard, || {
            ran = true;
            Ok(())
        });

        assert!(matches!(result, Err(GuardError::AlreadyRunning { .. })));
        assert!(!ran);
        assert_eq!(fs::read_to_string(&marker).unwrap(), "/lib/movie.mkv\n");
    }

    #[test]
    fn test_with_guard_releases_only_after_success() {
        let dir = TempDir::new().unwrap();
        let guard = MarkerFile::new(dir.path().join("RUNNING"));

        let value: Result<u32, GuardError> = with_guard(&guard, || {
            assert!(guard.path().exists());
            Ok(3)
        });
        assert_eq!(value.unwrap(), 3);
        assert!(!guard.path().exists());

        let failed: Result<(), GuardError> = with_guard(&guard, || {
            Err(GuardError::Io {
                path: PathBuf::from("/lib/a.mkv"),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            })
        });
        assert!(failed.is_err());
        assert!(guard.path().exists());
    }

    #[test]
    fn test_stale_memory_guard_refuses() {
        let guard = MemoryGuard::stale(Path::new("/crashed.mkv"));
        assert!(matches!(
            guard.acquire(),
            Err(GuardError::AlreadyRunning { ref busy_with, .. }) if busy_with == "/crashed.mkv"
        ));
    }
}
