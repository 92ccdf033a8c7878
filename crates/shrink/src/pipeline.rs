//! Per-file pipeline: eligibility, checkpoint, probe, classify, custody.
//!
//! Every candidate runs to completion before the next is looked at. Problems
//! with a single file are logged, reported and counted; only ledger and crash
//! guard failures end the run.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use crate::classifier::{classify, ClassifierSettings, Decision, DecisionReason};
use crate::config::ShrinkConfig;
use crate::custody::{Custodian, CustodyError, CustodySettings, MIN_OUTPUT_BYTES};
use crate::ffprobe::Prober;
use crate::guard::{with_guard, CrashGuard, GuardError};
use crate::handbrake::{EncodeSettings, Transcoder};
use crate::ledger::{Ledger, LedgerError};
use crate::report::Reporter;
use crate::scan::Candidate;
use crate::sidecar::has_skip_marker;

/// Error-report text for inputs moved to the trash without transcoding
pub const QUARANTINED_REASON: &str = "Input doesn't have audio and video streams, moved to trash";

/// Error-report text when quarantining itself failed
pub const QUARANTINE_FAILED_REASON: &str = "Move to trash error (before transcoding)";

/// Error-report text for videos whose frame has no area
pub const ANOMALOUS_REASON: &str = "Video frame has zero width or height, left untouched";

/// Why a candidate never reached the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Gone between the walk and now
    Vanished,
    NotAFile,
    SkipMarker,
    UntrackedExtension,
    TooNew,
    AlreadyChecked,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Vanished => write!(f, "no longer exists"),
            SkipReason::NotAFile => write!(f, "not a regular file"),
            SkipReason::SkipMarker => write!(f, "skip marker present"),
            SkipReason::UntrackedExtension => write!(f, "extension not tracked"),
            SkipReason::TooNew => write!(f, "too new"),
            SkipReason::AlreadyChecked => write!(f, "already checked"),
        }
    }
}

/// Result of one pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum Stage<T> {
    Skip(SkipReason),
    Proceed(T),
}

impl<T> Stage<T> {
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Stage<U>) -> Stage<U> {
        match self {
            Stage::Skip(reason) => Stage::Skip(reason),
            Stage::Proceed(value) => f(value),
        }
    }
}

/// What happened to one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Skipped(SkipReason),
    /// No audio or video stream; moved to the trash mirror
    Quarantined,
    /// Evaluated and left in place
    Kept(Decision),
    Transcoded { destination: PathBuf, oversized: bool },
    /// Reported in the error report and left for the operator
    Failed(String),
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub seen: usize,
    pub skipped: usize,
    /// Evaluated for the first time in this run
    pub checked: usize,
    pub kept: usize,
    pub quarantined: usize,
    pub transcoded: usize,
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        self.seen += 1;
        match outcome {
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Quarantined => {
                self.checked += 1;
                self.quarantined += 1;
            }
            Outcome::Kept(_) => {
                self.checked += 1;
                self.kept += 1;
            }
            Outcome::Transcoded { .. } => {
                self.checked += 1;
                self.transcoded += 1;
            }
            Outcome::Failed(_) => {
                self.checked += 1;
                self.failed += 1;
            }
        }
    }
}

/// Failures that stop the run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Guard(#[from] GuardError),
}

/// Everything the pipeline reads from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub dotfile_skip: String,
    /// Lower-case tracked extensions with the leading period
    pub extensions: Vec<String>,
    pub delay: Duration,
    pub classifier: ClassifierSettings,
    pub custody: CustodySettings,
}

impl PipelineSettings {
    pub fn from_config(cfg: &ShrinkConfig, library_root: &Path) -> Self {
        Self {
            dotfile_skip: cfg.dotfile_skip.clone(),
            extensions: cfg.extensions.clone(),
            delay: cfg.delay(),
            classifier: ClassifierSettings::from_config(cfg),
            custody: CustodySettings {
                library_root: library_root.to_path_buf(),
                scratch_dir: cfg.working_path.clone(),
                trash_root: cfg.trash_path.clone(),
                min_output_bytes: MIN_OUTPUT_BYTES,
                encode: EncodeSettings::from_config(cfg),
            },
        }
    }
}

/// Stat the path. Anything that is not a regular file is skipped.
pub fn still_exists(path: &Path) -> Stage<Candidate> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Stage::Proceed(Candidate::from_metadata(path, &metadata)),
        Ok(_) => Stage::Skip(SkipReason::NotAFile),
        Err(_) => Stage::Skip(SkipReason::Vanished),
    }
}

pub fn not_skip_marked(candidate: Candidate, marker: &str) -> Stage<Candidate> {
    if has_skip_marker(&candidate.path, marker) {
        Stage::Skip(SkipReason::SkipMarker)
    } else {
        Stage::Proceed(candidate)
    }
}

pub fn tracked_extension(candidate: Candidate, extensions: &[String]) -> Stage<Candidate> {
    if extensions.iter().any(|e| *e == candidate.extension) {
        Stage::Proceed(candidate)
    } else {
        Stage::Skip(SkipReason::UntrackedExtension)
    }
}

/// Proceed once the file is at least `delay` old at `now`
pub fn old_enough(candidate: Candidate, delay: Duration, now: DateTime<Utc>) -> Stage<Candidate> {
    if now.signed_duration_since(candidate.timestamp) >= delay {
        Stage::Proceed(candidate)
    } else {
        Stage::Skip(SkipReason::TooNew)
    }
}

pub fn not_checked(candidate: Candidate, ledger: &dyn Ledger) -> Stage<Candidate> {
    if ledger.is_checked(&candidate.path) {
        Stage::Skip(SkipReason::AlreadyChecked)
    } else {
        Stage::Proceed(candidate)
    }
}

/// Drives candidates through the pipeline against injected collaborators
pub struct Engine<'a> {
    settings: &'a PipelineSettings,
    prober: &'a dyn Prober,
    transcoder: &'a dyn Transcoder,
    guard: &'a dyn CrashGuard,
    ledger: &'a mut dyn Ledger,
    reporter: &'a mut dyn Reporter,
}

impl<'a> Engine<'a> {
    pub fn new(
        settings: &'a PipelineSettings,
        prober: &'a dyn Prober,
        transcoder: &'a dyn Transcoder,
        guard: &'a dyn CrashGuard,
        ledger: &'a mut dyn Ledger,
        reporter: &'a mut dyn Reporter,
    ) -> Self {
        Self {
            settings,
            prober,
            transcoder,
            guard,
            ledger,
            reporter,
        }
    }

    /// Process every candidate in order.
    ///
    /// Stops at the first ledger or crash guard failure; the caller decides
    /// what to do with the marker.
    pub fn run<I>(&mut self, candidates: I) -> Result<RunSummary, RunError>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut summary = RunSummary::default();
        for path in candidates {
            let outcome = self.process(&path)?;
            summary.record(&outcome);
        }
        info!(
            "Run complete: {} seen, {} skipped, {} checked, {} kept, {} quarantined, {} transcoded, {} failed",
            summary.seen,
            summary.skipped,
            summary.checked,
            summary.kept,
            summary.quarantined,
            summary.transcoded,
            summary.failed
        );
        Ok(summary)
    }

    /// [`Engine::run`] inside the crash guard: nothing is looked at unless
    /// the guard can be acquired, and the marker is removed only after a
    /// clean run.
    pub fn run_guarded<I>(&mut self, candidates: I) -> Result<RunSummary, RunError>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let guard = self.guard;
        with_guard(guard, || self.run(candidates))
    }

    /// Take one path through the pipeline
    pub fn process(&mut self, path: &Path) -> Result<Outcome, RunError> {
        let candidate = match self.eligible(path, Utc::now()) {
            Stage::Proceed(candidate) => candidate,
            Stage::Skip(reason) => {
                debug!("Skipping {}: {}", path.display(), reason);
                return Ok(Outcome::Skipped(reason));
            }
        };

        // Checkpoint first: a file that breaks the probe or the transcoder is
        // never retried
        self.ledger.mark_checked(&candidate.path)?;
        info!("Checking: {}", candidate.path.display());

        let probe = match self.prober.probe(&candidate.path) {
            Ok(probe) => probe,
            Err(e) => return self.fail(&candidate.path, &format!("Probe error: {}", e)),
        };
        debug!(
            "{}: {} audio, {} video, {} b/s, {}x{}, codec {}",
            candidate.path.display(),
            probe.audio_streams,
            probe.video_streams,
            probe.bitrate,
            probe.width,
            probe.height,
            probe.codec
        );

        let settings = self.settings;
        let custodian = Custodian::new(&settings.custody, self.prober, self.transcoder);

        if !probe.has_audio_and_video() {
            return match custodian.quarantine(&candidate) {
                Ok(_) => {
                    self.reporter.record_error(&candidate.path, QUARANTINED_REASON)?;
                    Ok(Outcome::Quarantined)
                }
                Err(e) => {
                    error!("Quarantine failed for {}: {}", candidate.path.display(), e);
                    self.fail(&candidate.path, QUARANTINE_FAILED_REASON)
                }
            };
        }

        let decision = classify(&probe, &candidate.extension, &settings.classifier);
        if decision.reason == DecisionReason::Anomalous {
            self.reporter.record_error(&candidate.path, ANOMALOUS_REASON)?;
        }
        if !decision.transcode {
            debug!(
                "Keeping {} ({}, threshold {:.1})",
                candidate.path.display(),
                decision.reason,
                decision.applied_threshold
            );
            return Ok(Outcome::Kept(decision));
        }

        match custodian.replace(
            &candidate,
            &probe,
            &decision,
            self.guard,
            &mut *self.ledger,
            &mut *self.reporter,
        ) {
            Ok(replaced) => Ok(Outcome::Transcoded {
                destination: replaced.destination,
                oversized: replaced.oversized,
            }),
            Err(CustodyError::Ledger(e)) => Err(e.into()),
            Err(CustodyError::Guard(e)) => Err(e.into()),
            Err(e) => {
                error!("Custody failed for {}: {}", candidate.path.display(), e);
                self.fail(&candidate.path, &e.to_string())
            }
        }
    }

    /// Eligibility stages, cheapest first
    fn eligible(&self, path: &Path, now: DateTime<Utc>) -> Stage<Candidate> {
        let settings = self.settings;
        let ledger: &dyn Ledger = &*self.ledger;

        still_exists(path)
            .and_then(|c| not_skip_marked(c, &settings.dotfile_skip))
            .and_then(|c| tracked_extension(c, &settings.extensions))
            .and_then(|c| old_enough(c, settings.delay, now))
            .and_then(|c| not_checked(c, ledger))
    }

    fn fail(&mut self, path: &Path, reason: &str) -> Result<Outcome, RunError> {
        warn!("{}: {}", reason, path.display());
        self.reporter.record_error(path, reason)?;
        Ok(Outcome::Failed(reason.to_string()))
    }
}
