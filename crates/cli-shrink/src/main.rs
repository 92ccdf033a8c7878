use anyhow::{bail, Context, Result};
use clap::Parser;
use shrink::{
    guard::{with_guard, MarkerFile},
    ledger::FileLedger,
    pipeline::{Engine, PipelineSettings},
    preflight,
    report::FileReporter,
    scan,
    FfprobeCli, HandBrakeCli, ShrinkConfig,
};
use std::env;
use std::path::{Path, PathBuf};
use chrono::Utc;
use log::info;

/// Environment variable naming the configuration file
const CONFIG_ENV: &str = "SHRINK_VIDEO_CONFIG";

const CONFIG_FILE_NAME: &str = "config.toml";

/// Re-encode over-quality videos in a media library, keeping every original
/// in a trash mirror
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Library root to process (defaults to the current directory)
    root: Option<PathBuf>,
}

fn main() -> Result<()> {
    // RUST_LOG overrides the default info level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    let cwd = env::current_dir().context("Failed to read current directory")?;

    let config_path = locate_config(&cwd)?;
    let mut cfg = ShrinkConfig::load_config(config_path.as_deref())
        .context("Failed to load configuration")?;
    let config_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());
    cfg.resolve_paths(&config_dir);

    let root = args.root.unwrap_or_else(|| cwd.clone());
    let root = root
        .canonicalize()
        .with_context(|| format!("Library root does not exist: {}", root.display()))?;

    info!("shrink-video starting at {}", Utc::now().to_rfc3339());
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }
    info!("  Library root: {}", root.display());
    info!("  Working path: {}", cfg.working_path.display());
    info!("  Trash path: {}", cfg.trash_path.display());
    info!(
        "  Threshold: {} (+{} at or below 1000px), max width {}",
        cfg.threshold, cfg.low_res_offset, cfg.max_width
    );
    info!("  Encoder: x264 q{} preset {}", cfg.encode_quality, cfg.speed);

    preflight::run_preflight(&cfg, &root).context("Preflight checks failed")?;

    let guard = MarkerFile::new(&cfg.running_path);
    // A failed run leaves the marker so the next one refuses to start
    let transcoded = with_guard(&guard, || process_library(&cfg, &root, &guard))?;

    info!("Transcoded {} file(s).", transcoded);
    info!("shrink-video exiting at {}", Utc::now().to_rfc3339());
    Ok(())
}

/// Walk the library and run every file through the pipeline.
/// Returns the number of files replaced.
fn process_library(cfg: &ShrinkConfig, root: &Path, guard: &MarkerFile) -> Result<usize> {
    preflight::prepare_state_files(cfg).context("State files are not writable")?;

    let mut ledger = FileLedger::open(&cfg.checked_path, &cfg.transcoded_path)
        .context("Failed to open checked ledger")?;
    info!("Loaded {} checked entries", ledger.len());

    let mut reporter = FileReporter::new(&cfg.error_path, &cfg.too_big_after_path);
    reporter.touch().context("Failed to open error report")?;

    let settings = PipelineSettings::from_config(cfg, root);
    let prober = FfprobeCli::new(&cfg.ffprobe_bin);
    let transcoder = HandBrakeCli::new(&cfg.handbrake_bin);

    // Scratch and trash are never walked, even when they live in the library
    let excluded: Vec<PathBuf> = [&cfg.working_path, &cfg.trash_path]
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .collect();

    let summary = Engine::new(
        &settings,
        &prober,
        &transcoder,
        guard,
        &mut ledger,
        &mut reporter,
    )
    .run(scan::walk(root, excluded))
    .context("Run aborted")?;

    Ok(summary.transcoded)
}

/// Find the configuration file: the environment variable first, then a
/// config.toml next to the executable, then one in the working directory
fn locate_config(cwd: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = env::var_os(CONFIG_ENV) {
        let path = PathBuf::from(path);
        if !path.is_file() {
            bail!("{} points at a missing file: {}", CONFIG_ENV, path.display());
        }
        return Ok(Some(path));
    }

    let beside_exe = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME)));
    let candidates = beside_exe.into_iter().chain(Some(cwd.join(CONFIG_FILE_NAME)));

    for candidate in candidates {
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}
