use std::path::{Path, PathBuf};
use chrono::{SecondsFormat, Utc};
use crate::ledger::{AppendLog, LedgerError};

/// Operator-facing reports of per-file problems
pub trait Reporter {
    /// A file failed somewhere in the pipeline and was left as described
    fn record_error(&mut self, path: &Path, reason: &str) -> Result<(), LedgerError>;

    /// A replaced file is still above the threshold or did not shrink
    fn record_oversized(&mut self, path: &Path, quality: f64) -> Result<(), LedgerError>;
}

/// Reports appended to the error and too-big-after files
#[derive(Debug, Clone)]
pub struct FileReporter {
    errors: AppendLog,
    oversized: AppendLog,
}

impl FileReporter {
    pub fn new(error_path: &Path, too_big_after_path: &Path) -> Self {
        Self {
            errors: AppendLog::new(error_path),
            oversized: AppendLog::new(too_big_after_path),
        }
    }

    /// Create the error report up front so an unwritable location fails setup
    pub fn touch(&self) -> Result<(), LedgerError> {
        self.errors.touch()
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Reporter for FileReporter {
    fn record_error(&mut self, path: &Path, reason: &str) -> Result<(), LedgerError> {
        self.errors
            .append(&format!("{} {}: {}", timestamp(), reason, path.display()))
    }

    fn record_oversized(&mut self, path: &Path, quality: f64) -> Result<(), LedgerError> {
        self.oversized
            .append(&format!("{} {:.1}: {}", timestamp(), quality, path.display()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryReporter {
    pub errors: Vec<(PathBuf, String)>,
    pub oversized: Vec<(PathBuf, f64)>,
}

impl Reporter for MemoryReporter {
    fn record_error(&mut self, path: &Path, reason: &str) -> Result<(), LedgerError> {
        self.errors.push((path.to_path_buf(), reason.to_string()));
        Ok(())
    }

    fn record_oversized(&mut self, path: &Path, quality: f64) -> Result<(), LedgerError> {
        self.oversized.push((path.to_path_buf(), quality));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_report_lines() {
        let dir = TempDir::new().unwrap();
        let mut reporter =
            FileReporter::new(&dir.path().join("errors"), &dir.path().join("toobigafter"));

        reporter
            .record_error(Path::new("/lib/a.mkv"), "No output file found")
            .unwrap();
        reporter
            .record_oversized(Path::new("/lib/b.mkv"), 2.96)
            .unwrap();

        let errors = fs::read_to_string(dir.path().join("errors")).unwrap();
        assert!(errors.ends_with(" No output file found: /lib/a.mkv\n"), "{}", errors);

        let oversized = fs::read_to_string(dir.path().join("toobigafter")).unwrap();
        assert!(oversized.ends_with(" 3.0: /lib/b.mkv\n"), "{}", oversized);
    }

    #[test]
    fn test_touch_creates_error_report_only() {
        let dir = TempDir::new().unwrap();
        let reporter =
            FileReporter::new(&dir.path().join("errors"), &dir.path().join("toobigafter"));
        reporter.touch().unwrap();
        assert!(dir.path().join("errors").exists());
        assert!(!dir.path().join("toobigafter").exists());
    }
}
