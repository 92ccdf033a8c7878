use std::path::{Path, PathBuf};
use std::process::Command;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

/// Error type for probe operations
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The file vanished before or while it was probed
    #[error("file does not exist: {0}")]
    Missing(PathBuf),

    /// ffprobe exited with a non-zero status
    #[error("ffprobe failed (exit code {code}) for {path}: {stderr}")]
    Failed {
        path: PathBuf,
        code: i32,
        stderr: String,
    },

    /// ffprobe output could not be parsed
    #[error("failed to parse ffprobe output for {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// ffprobe could not be spawned
    #[error("failed to execute ffprobe: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary numbers the classifier and custody steps need
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub audio_streams: u32,
    pub video_streams: u32,
    /// Container-level bitrate in bits per second
    pub bitrate: u64,
    /// Width of the first video stream in pixels
    pub width: u32,
    /// Height of the first video stream in pixels
    pub height: u32,
    /// Codec of the first video stream, empty when unknown
    pub codec: String,
}

impl ProbeResult {
    /// A file is playable when it carries at least one audio and one video stream
    pub fn has_audio_and_video(&self) -> bool {
        self.audio_streams > 0 && self.video_streams > 0
    }

    /// Bits per second per pixel, or None for a zero-area frame
    pub fn quality(&self) -> Option<f64> {
        let area = u64::from(self.width) * u64::from(self.height);
        if area == 0 {
            return None;
        }
        Some(self.bitrate as f64 / area as f64)
    }
}

/// Source of probe results
pub trait Prober {
    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError>;
}

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
struct FFProbeData {
    #[serde(default)]
    streams: Vec<FFProbeStream>,
    format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
struct FFProbeFormat {
    bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
struct FFProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Runs the ffprobe binary once per file
#[derive(Debug, Clone)]
pub struct FfprobeCli {
    bin: PathBuf,
}

impl FfprobeCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// Build the ffprobe invocation for a file
    pub fn command(&self, file_path: &Path) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path);
        cmd
    }
}

impl Prober for FfprobeCli {
    fn probe(&self, file_path: &Path) -> Result<ProbeResult, ProbeError> {
        if !file_path.exists() {
            return Err(ProbeError::Missing(file_path.to_path_buf()));
        }

        debug!("ffprobe: probing {}", file_path.display());
        let output = self.command(file_path).output()?;

        if !output.status.success() {
            // The file may have been removed while ffprobe was reading it
            if !file_path.exists() {
                return Err(ProbeError::Missing(file_path.to_path_buf()));
            }
            return Err(ProbeError::Failed {
                path: file_path.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let json_str = String::from_utf8_lossy(&output.stdout);
        parse_probe_output(&json_str).map_err(|message| ProbeError::Parse {
            path: file_path.to_path_buf(),
            message,
        })
    }
}

/// Parse ffprobe JSON into a ProbeResult.
///
/// Missing or unparsable numeric fields become zero and a missing codec becomes
/// the empty string.
pub fn parse_probe_output(json_str: &str) -> Result<ProbeResult, String> {
    let data: FFProbeData = serde_json::from_str(json_str).map_err(|e| e.to_string())?;

    let count = |kind: &str| {
        data.streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some(kind))
            .count() as u32
    };
    let audio_streams = count("audio");
    let video_streams = count("video");

    let video = data
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let bitrate = data
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.trim().parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeResult {
        audio_streams,
        video_streams,
        bitrate,
        width: video.and_then(|v| v.width).unwrap_or(0),
        height: video.and_then(|v| v.height).unwrap_or(0),
        codec: video
            .and_then(|v| v.codec_name.clone())
            .unwrap_or_default()
            .to_lowercase(),
    })
}
