use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use log::{debug, warn};
use thiserror::Error;
use crate::config::ShrinkConfig;

/// Error type for transcoder invocations
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// HandBrakeCLI could not be started or waited on
    #[error("failed to execute transcoder: {0}")]
    Io(#[from] std::io::Error),
}

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mkv,
    Mp4,
}

impl Container {
    /// Extension without the leading period
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
        }
    }

    /// HandBrakeCLI `--format` value
    pub fn handbrake_format(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "av_mp4",
        }
    }
}

/// Encoder tunables shared by every job of a run
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    /// x264 constant quality
    pub quality: u8,
    /// x264 preset
    pub speed: String,
    pub max_width: u32,
}

impl EncodeSettings {
    pub fn from_config(cfg: &ShrinkConfig) -> Self {
        Self {
            quality: cfg.encode_quality,
            speed: cfg.speed.clone(),
            max_width: cfg.max_width,
        }
    }

    /// Output width for a source of the given width
    pub fn target_width(&self, source_width: u32) -> u32 {
        source_width.min(self.max_width)
    }
}

/// One transcoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub width: u32,
    pub quality: u8,
    pub speed: String,
    pub container: Container,
}

/// External transcoder
pub trait Transcoder {
    /// Run the transcoder to completion. Success only means the process ran;
    /// callers validate the output themselves.
    fn transcode(&self, job: &TranscodeJob) -> Result<(), TranscodeError>;
}

/// Build a HandBrakeCLI command: AAC stereo at 128 kbps, x264, subtitle
/// tracks 1-5 passed through, loose crop to the target width.
pub fn build_handbrake_command(bin: &Path, job: &TranscodeJob) -> Command {
    let mut cmd = Command::new(bin);

    // Chapter markers and audio
    cmd.arg("-m")
        .arg("-E")
        .arg("ffaac")
        .arg("-B")
        .arg("128")
        .arg("-6")
        .arg("stereo");

    // Picture
    cmd.arg("-X").arg(job.width.to_string()).arg("--loose-crop");

    // Video encoder
    cmd.arg("-e")
        .arg("x264")
        .arg("-q")
        .arg(job.quality.to_string())
        .arg("--x264-preset")
        .arg(&job.speed);

    // Subtitles
    cmd.arg("-s").arg("1,2,3,4,5");

    // Container; MP4 output is web optimised
    cmd.arg("-f").arg(job.container.handbrake_format());
    if job.container == Container::Mp4 {
        cmd.arg("-O");
    }

    cmd.arg("-i").arg(&job.input);
    cmd.arg("-o").arg(&job.output);

    cmd
}

/// Runs the HandBrakeCLI binary
#[derive(Debug, Clone)]
pub struct HandBrakeCli {
    bin: PathBuf,
}

impl HandBrakeCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Transcoder for HandBrakeCli {
    fn transcode(&self, job: &TranscodeJob) -> Result<(), TranscodeError> {
        let mut cmd = build_handbrake_command(&self.bin, job);
        debug!("transcode command: {:?}", cmd);

        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        if !status.success() {
            // The output is validated regardless of the exit status
            warn!(
                "HandBrakeCLI exited with {} for {}",
                status,
                job.input.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn job(container: Container) -> TranscodeJob {
        TranscodeJob {
            input: PathBuf::from("/lib/Show/ep 1.avi"),
            output: PathBuf::from("/scratch/ep 1.mkv"),
            width: 1280,
            quality: 22,
            speed: "medium".to_string(),
            container,
        }
    }

    #[test]
    fn test_mkv_command() {
        let cmd = build_handbrake_command(Path::new("HandBrakeCLI"), &job(Container::Mkv));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), "HandBrakeCLI");
        assert!(has_flag_with_value(&args, "-E", "ffaac"));
        assert!(has_flag_with_value(&args, "-B", "128"));
        assert!(has_flag_with_value(&args, "-6", "stereo"));
        assert!(has_flag_with_value(&args, "-X", "1280"));
        assert!(has_flag_with_value(&args, "-e", "x264"));
        assert!(has_flag_with_value(&args, "-q", "22"));
        assert!(has_flag_with_value(&args, "--x264-preset", "medium"));
        assert!(has_flag_with_value(&args, "-s", "1,2,3,4,5"));
        assert!(has_flag_with_value(&args, "-f", "mkv"));
        assert!(has_flag_with_value(&args, "-i", "/lib/Show/ep 1.avi"));
        assert!(has_flag_with_value(&args, "-o", "/scratch/ep 1.mkv"));
        assert!(!args.iter().any(|a| a == "-O"));
    }

    #[test]
    fn test_mp4_command_is_web_optimised() {
        let cmd = build_handbrake_command(Path::new("HandBrakeCLI"), &job(Container::Mp4));
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-f", "av_mp4"));
        assert!(args.iter().any(|a| a == "-O"));
    }

    #[test]
    fn test_target_width_is_capped() {
        let settings = EncodeSettings {
            quality: 22,
            speed: "fast".to_string(),
            max_width: 1920,
        };
        assert_eq!(settings.target_width(3840), 1920);
        assert_eq!(settings.target_width(1280), 1280);
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let transcoder = HandBrakeCli::new("/nonexistent/HandBrakeCLI");
        assert!(matches!(
            transcoder.transcode(&job(Container::Mkv)),
            Err(TranscodeError::Io(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_paths_are_single_arguments(
            name in "[a-zA-Z0-9 ;&$'\"_-]{1,30}",
        ) {
            let mut j = job(Container::Mkv);
            j.input = PathBuf::from(format!("/lib/{}.avi", name));
            j.output = PathBuf::from(format!("/scratch/{}.mkv", name));

            let cmd = build_handbrake_command(Path::new("HandBrakeCLI"), &j);
            let args = get_command_args(&cmd);

            let input = format!("/lib/{}.avi", name);
            let output = format!("/scratch/{}.mkv", name);
            prop_assert!(has_flag_with_value(&args, "-i", &input));
            prop_assert_eq!(args.last().cloned(), Some(output));
        }
    }
}
