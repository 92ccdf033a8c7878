//! Custody protocol: replace an original with its transcoded version, or leave
//! it exactly where it was.
//!
//! Order matters. The transcoder writes into the scratch directory, the
//! output is validated there, the original is moved into the trash mirror and
//! only then is the output promoted into the original's directory. A failure
//! at any step leaves at least one intact copy on disk.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use humansize::{format_size, BINARY};
use log::{error, info, warn};
use thiserror::Error;
use crate::classifier::Decision;
use crate::ffprobe::{ProbeError, ProbeResult, Prober};
use crate::guard::{BusySlot, CrashGuard, GuardError};
use crate::handbrake::{Container, EncodeSettings, TranscodeError, TranscodeJob, Transcoder};
use crate::ledger::{Ledger, LedgerError};
use crate::report::Reporter;
use crate::scan::Candidate;

/// Outputs smaller than this are treated as a failed encode
pub const MIN_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Containers tried in order; the next one is used only when the previous
/// output came out undersized
const CONTAINER_FALLBACK: [Container; 2] = [Container::Mkv, Container::Mp4];

fn human(bytes: &u64) -> String {
    format_size(*bytes, BINARY)
}

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("No output file found")]
    NoOutput,

    #[error("Output under {}, aborted ({})", human(.floor), human(.size))]
    Undersized { size: u64, floor: u64 },

    #[error("Output doesn't have audio and video streams, aborted")]
    MissingStreams,

    #[error("Output could not be probed, aborted: {0}")]
    OutputProbe(ProbeError),

    #[error("Scratch file {0} already exists, aborted")]
    ScratchOccupied(PathBuf),

    #[error("Destination {0} already exists, aborted")]
    DestinationOccupied(PathBuf),

    #[error("Transcoder error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Move to trash error: {0}")]
    TrashMove(io::Error),

    #[error("Move from scratch error, original is in the trash: {0}")]
    Promote(io::Error),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CustodyError {
    /// Errors that must stop the whole run rather than just this file
    pub fn is_fatal(&self) -> bool {
        matches!(self, CustodyError::Guard(_) | CustodyError::Ledger(_))
    }
}

/// Where custody moves files
#[derive(Debug, Clone, PartialEq)]
pub struct CustodySettings {
    pub library_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub trash_root: PathBuf,
    pub min_output_bytes: u64,
    pub encode: EncodeSettings,
}

/// A completed replacement
#[derive(Debug, Clone, PartialEq)]
pub struct Replaced {
    /// Where the transcoded file now lives
    pub destination: PathBuf,
    /// Where the original now lives
    pub trash: PathBuf,
    pub container: Container,
    /// The replacement is still above the threshold or did not shrink
    pub oversized: bool,
}

pub struct Custodian<'a> {
    settings: &'a CustodySettings,
    prober: &'a dyn Prober,
    transcoder: &'a dyn Transcoder,
}

impl<'a> Custodian<'a> {
    pub fn new(
        settings: &'a CustodySettings,
        prober: &'a dyn Prober,
        transcoder: &'a dyn Transcoder,
    ) -> Self {
        Self {
            settings,
            prober,
            transcoder,
        }
    }

    /// Trash mirror location for a file: its path relative to the library
    /// root, re-rooted under the trash root
    pub fn trash_path_for(&self, original: &Path) -> PathBuf {
        match original.strip_prefix(&self.settings.library_root) {
            Ok(relative) => self.settings.trash_root.join(relative),
            Err(_) => {
                let relative: PathBuf = original
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .collect();
                self.settings.trash_root.join(relative)
            }
        }
    }

    /// Trash mirror location that is not yet taken. An earlier original of
    /// the same name stays put; the newcomer gets a numbered name such as
    /// `movie.1.mkv`.
    pub fn free_trash_path(&self, original: &Path) -> PathBuf {
        let trash = self.trash_path_for(original);
        if !occupied(&trash) {
            return trash;
        }

        let stem = trash
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        let extension = trash.extension().map(|e| e.to_os_string());
        let mut n: u32 = 1;
        loop {
            let mut name = stem.clone();
            name.push(format!(".{}", n));
            if let Some(ext) = &extension {
                name.push(".");
                name.push(ext);
            }
            let candidate = trash.with_file_name(name);
            if !occupied(&candidate) {
                warn!(
                    "{} already holds an earlier original, using {}",
                    trash.display(),
                    candidate.display()
                );
                return candidate;
            }
            n += 1;
        }
    }

    /// Move an unplayable input straight into the trash mirror.
    ///
    /// Returns where the file went.
    pub fn quarantine(&self, candidate: &Candidate) -> Result<PathBuf, CustodyError> {
        let trash = self.free_trash_path(&candidate.path);
        move_file(&candidate.path, &trash).map_err(CustodyError::TrashMove)?;
        warn!(
            "Input doesn't have audio and video streams, moved {} to {}",
            candidate.path.display(),
            trash.display()
        );
        Ok(trash)
    }

    /// Transcode `candidate` and swap the result in for the original.
    ///
    /// The crash guard is busy with the candidate for the whole call. On any
    /// error before the trash move the original is untouched and no scratch
    /// output is left behind; after a failed trash move the validated output
    /// stays in the scratch directory.
    pub fn replace(
        &self,
        candidate: &Candidate,
        probe: &ProbeResult,
        decision: &Decision,
        guard: &dyn CrashGuard,
        ledger: &mut dyn Ledger,
        reporter: &mut dyn Reporter,
    ) -> Result<Replaced, CustodyError> {
        let original = &candidate.path;
        let dir = original.parent().unwrap_or_else(|| Path::new(""));
        let stem = candidate.name_stem();

        ensure_free(&dir.join(format!("{}.{}", stem, Container::Mkv.extension())), original)?;

        let _busy = BusySlot::new(guard, original)?;
        info!(
            "Transcoding: {} ({}, {})",
            original.display(),
            decision.reason,
            decision
                .quality
                .map(|q| format!("{:.2} bits/px", q))
                .unwrap_or_else(|| "unknown quality".to_string())
        );

        let width = self.settings.encode.target_width(probe.width);
        let (scratch, container) = self.encode_validated(original, &stem, width)?;

        let destination = dir.join(format!("{}.{}", stem, container.extension()));
        if let Err(e) = ensure_free(&destination, original) {
            remove_scratch(&scratch);
            return Err(e);
        }

        let trash = self.free_trash_path(original);
        if let Err(e) = move_file(original, &trash) {
            error!(
                "Move to trash failed for {}, leaving output in {}",
                original.display(),
                scratch.display()
            );
            return Err(CustodyError::TrashMove(e));
        }

        move_file(&scratch, &destination).map_err(CustodyError::Promote)?;
        ledger.mark_transcoded(original)?;
        info!("Replaced {} with {}", original.display(), destination.display());

        let oversized = self.audit(&destination, probe, decision, reporter)?;

        Ok(Replaced {
            destination,
            trash,
            container,
            oversized,
        })
    }

    /// Run the transcoder into the scratch directory until an output passes
    /// validation, falling back to the next container on undersized output
    fn encode_validated(
        &self,
        original: &Path,
        stem: &str,
        width: u32,
    ) -> Result<(PathBuf, Container), CustodyError> {
        let floor = self.settings.min_output_bytes;
        let mut undersized = 0;

        for container in CONTAINER_FALLBACK {
            let scratch = self
                .settings
                .scratch_dir
                .join(format!("{}.{}", stem, container.extension()));
            if scratch.exists() {
                return Err(CustodyError::ScratchOccupied(scratch));
            }

            let job = TranscodeJob {
                input: original.to_path_buf(),
                output: scratch.clone(),
                width,
                quality: self.settings.encode.quality,
                speed: self.settings.encode.speed.clone(),
                container,
            };
            if let Err(e) = self.transcoder.transcode(&job) {
                remove_scratch(&scratch);
                return Err(e.into());
            }

            let size = match fs::metadata(&scratch) {
                Ok(metadata) => metadata.len(),
                Err(_) => return Err(CustodyError::NoOutput),
            };
            if size < floor {
                remove_scratch(&scratch);
                warn!(
                    "{} output for {} is only {}",
                    container.extension(),
                    original.display(),
                    format_size(size, BINARY)
                );
                undersized = size;
                continue;
            }

            return match self.prober.probe(&scratch) {
                Ok(output) if output.has_audio_and_video() => Ok((scratch, container)),
                Ok(_) => {
                    remove_scratch(&scratch);
                    Err(CustodyError::MissingStreams)
                }
                Err(e) => {
                    remove_scratch(&scratch);
                    Err(CustodyError::OutputProbe(e))
                }
            };
        }

        Err(CustodyError::Undersized {
            size: undersized,
            floor,
        })
    }

    /// Re-probe the promoted file and report it if it is still over the
    /// applied threshold or did not come out smaller
    fn audit(
        &self,
        destination: &Path,
        before: &ProbeResult,
        decision: &Decision,
        reporter: &mut dyn Reporter,
    ) -> Result<bool, CustodyError> {
        let after = match self.prober.probe(destination) {
            Ok(after) => after,
            Err(e) => {
                warn!("Could not re-probe {}: {}", destination.display(), e);
                return Ok(false);
            }
        };

        let quality = after.quality().unwrap_or(0.0);
        let oversized = quality > decision.applied_threshold || after.bitrate >= before.bitrate;
        if oversized {
            warn!(
                "Still oversized after transcode ({:.1} bits/px, {} -> {} b/s): {}",
                quality,
                before.bitrate,
                after.bitrate,
                destination.display()
            );
            reporter.record_oversized(destination, quality)?;
        }
        Ok(oversized)
    }
}

fn ensure_free(destination: &Path, original: &Path) -> Result<(), CustodyError> {
    if destination != original && destination.exists() {
        return Err(CustodyError::DestinationOccupied(destination.to_path_buf()));
    }
    Ok(())
}

fn remove_scratch(scratch: &Path) {
    if let Err(e) = fs::remove_file(scratch) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to delete scratch file {}: {}", scratch.display(), e);
        }
    }
}

fn occupied(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Move a file, creating the destination directory. An existing file at
/// `to` is never replaced. Falls back to copy and delete when a rename is not
/// possible (e.g. across filesystems); if the source cannot be deleted
/// afterwards the copy is removed again.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if occupied(to) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    // create_new keeps a file that appeared since the check above
    let mut source = fs::File::open(from)?;
    let permissions = source.metadata()?.permissions();
    let mut target = fs::OpenOptions::new().write(true).create_new(true).open(to)?;
    let copied = io::copy(&mut source, &mut target)
        .and_then(|_| target.set_permissions(permissions))
        .and_then(|_| target.sync_all());
    if let Err(e) = copied {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    if let Err(e) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    Ok(())
}
