//! Startup checks: external tools and directories before the crash guard is
//! taken, state files once it is held.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use log::info;
use thiserror::Error;
use crate::config::ShrinkConfig;
use crate::ledger::{AppendLog, LedgerError};

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("{tool} not available: `{bin} {arg}` failed; is it installed and in PATH? {detail}")]
    ToolUnavailable {
        tool: &'static str,
        bin: String,
        arg: &'static str,
        detail: String,
    },

    #[error("{what} is not a directory: {path}")]
    MissingDirectory { what: &'static str, path: PathBuf },

    #[error(transparent)]
    StateFile(#[from] LedgerError),
}

/// Run `<bin> <arg>` and require a successful exit
pub fn check_tool(tool: &'static str, bin: &Path, arg: &'static str) -> Result<(), PreflightError> {
    let unavailable = |detail: String| PreflightError::ToolUnavailable {
        tool,
        bin: bin.display().to_string(),
        arg,
        detail,
    };

    let status = Command::new(bin)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| unavailable(e.to_string()))?;

    if !status.success() {
        return Err(unavailable(format!("exited with {}", status)));
    }
    Ok(())
}

fn require_dir(what: &'static str, path: &Path) -> Result<(), PreflightError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(PreflightError::MissingDirectory {
            what,
            path: path.to_path_buf(),
        })
    }
}

/// Library root, scratch and trash directories must all exist
pub fn check_directories(cfg: &ShrinkConfig, library_root: &Path) -> Result<(), PreflightError> {
    require_dir("library root", library_root)?;
    require_dir("working_path", &cfg.working_path)?;
    require_dir("trash_path", &cfg.trash_path)?;
    Ok(())
}

/// Create the checked log and error report if missing so an unwritable
/// location fails before any file is looked at. Only call this while holding
/// the crash guard.
pub fn prepare_state_files(cfg: &ShrinkConfig) -> Result<(), PreflightError> {
    AppendLog::new(&cfg.checked_path).touch()?;
    AppendLog::new(&cfg.error_path).touch()?;
    Ok(())
}

/// Every check that writes nothing, in order
pub fn run_preflight(cfg: &ShrinkConfig, library_root: &Path) -> Result<(), PreflightError> {
    check_tool("ffprobe", &cfg.ffprobe_bin, "-version")?;
    check_tool("HandBrakeCLI", &cfg.handbrake_bin, "--version")?;
    check_directories(cfg, library_root)?;
    info!("Preflight checks passed for {}", library_root.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> ShrinkConfig {
        let mut cfg = ShrinkConfig::default_config();
        cfg.working_path = dir.path().join("scratch");
        cfg.trash_path = dir.path().join("trash");
        cfg.resolve_paths(dir.path());
        cfg
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let err = check_tool("ffprobe", Path::new("/nonexistent/ffprobe"), "-version").unwrap_err();
        assert!(matches!(err, PreflightError::ToolUnavailable { tool: "ffprobe", .. }));
        assert!(err.to_string().contains("/nonexistent/ffprobe -version"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_is_reported() {
        let err = check_tool("HandBrakeCLI", Path::new("false"), "--version").unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[cfg(unix)]
    #[test]
    fn test_working_tool_passes() {
        assert!(check_tool("HandBrakeCLI", Path::new("true"), "--version").is_ok());
    }

    #[test]
    fn test_directories_must_exist() {
        let dir = TempDir::new().unwrap();
        let cfg = config_in(&dir);

        let err = check_directories(&cfg, dir.path()).unwrap_err();
        assert!(matches!(err, PreflightError::MissingDirectory { what: "working_path", .. }));

        std::fs::create_dir_all(&cfg.working_path).unwrap();
        std::fs::create_dir_all(&cfg.trash_path).unwrap();
        check_directories(&cfg, dir.path()).unwrap();

        let err = check_directories(&cfg, &dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, PreflightError::MissingDirectory { what: "library root", .. }));
    }

    #[test]
    fn test_state_files_are_created() {
        let dir = TempDir::new().unwrap();
        let cfg = config_in(&dir);

        prepare_state_files(&cfg).unwrap();
        assert!(cfg.checked_path.exists());
        assert!(cfg.error_path.exists());
        assert!(!cfg.running_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_preflight_writes_no_state_files() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config_in(&dir);
        cfg.ffprobe_bin = PathBuf::from("true");
        cfg.handbrake_bin = PathBuf::from("true");
        std::fs::create_dir_all(&cfg.working_path).unwrap();
        std::fs::create_dir_all(&cfg.trash_path).unwrap();

        run_preflight(&cfg, dir.path()).unwrap();

        assert!(!cfg.checked_path.exists());
        assert!(!cfg.error_path.exists());
    }
}
