use log::warn;
use crate::config::ShrinkConfig;
use crate::ffprobe::ProbeResult;

/// Frames wider than this are judged against the base threshold
pub const HIGH_RES_CUTOFF: u32 = 1000;

/// Frames wider than this are reported as too big to handle
pub const TOO_BIG_WIDTH: u32 = 1920;

/// Why a file was or was not selected for transcoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Zero-area frame, the quality metric is undefined
    Anomalous,
    /// Codec is always re-encoded
    MandatoryCodec,
    /// Extension is always re-encoded
    MandatoryExtension,
    /// Wider than the allowed maximum
    ExceedsMaxWidth,
    /// Quality metric at or above the applied threshold
    AboveThreshold,
    /// Quality metric below the applied threshold
    BelowThreshold,
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionReason::Anomalous => write!(f, "zero-area frame"),
            DecisionReason::MandatoryCodec => write!(f, "mandatory codec"),
            DecisionReason::MandatoryExtension => write!(f, "mandatory extension"),
            DecisionReason::ExceedsMaxWidth => write!(f, "wider than max width"),
            DecisionReason::AboveThreshold => write!(f, "above threshold"),
            DecisionReason::BelowThreshold => write!(f, "below threshold"),
        }
    }
}

/// Result of classifying one probe
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub transcode: bool,
    /// Threshold the quality metric was compared against; the post-transcode
    /// check reuses it
    pub applied_threshold: f64,
    /// bits/s per pixel, None when the frame has no area
    pub quality: Option<f64>,
    pub reason: DecisionReason,
}

/// Tunables the classifier reads
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSettings {
    pub threshold: f64,
    pub low_res_offset: f64,
    pub max_width: u32,
    /// Lower-case extensions with the leading period
    pub mandatory_extensions: Vec<String>,
    /// Lower-case codec names
    pub mandatory_codecs: Vec<String>,
}

impl ClassifierSettings {
    pub fn from_config(cfg: &ShrinkConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            low_res_offset: cfg.low_res_offset,
            max_width: cfg.max_width,
            mandatory_extensions: cfg.mandatory_encode.clone(),
            mandatory_codecs: cfg.mandatory_codecs.clone(),
        }
    }

    /// Threshold that applies to a frame of the given width
    pub fn threshold_for(&self, width: u32) -> f64 {
        if width > HIGH_RES_CUTOFF {
            self.threshold
        } else {
            self.threshold + self.low_res_offset
        }
    }
}

/// Decide whether a probed file is over-quality for its resolution.
///
/// `extension` is the lower-cased extension including the leading period.
pub fn classify(probe: &ProbeResult, extension: &str, settings: &ClassifierSettings) -> Decision {
    let applied_threshold = settings.threshold_for(probe.width);

    let quality = match probe.quality() {
        Some(q) => q,
        None => {
            warn!(
                "zero-area frame ({}x{}), leaving file alone",
                probe.width, probe.height
            );
            return Decision {
                transcode: false,
                applied_threshold,
                quality: None,
                reason: DecisionReason::Anomalous,
            };
        }
    };

    if probe.width > TOO_BIG_WIDTH {
        warn!("{}px wide is too big to handle well", probe.width);
    }

    let (mut transcode, mut reason) = if quality >= applied_threshold {
        (true, DecisionReason::AboveThreshold)
    } else if probe.width > HIGH_RES_CUTOFF && probe.width > settings.max_width {
        (true, DecisionReason::ExceedsMaxWidth)
    } else {
        (false, DecisionReason::BelowThreshold)
    };

    if settings.mandatory_extensions.iter().any(|e| e == extension) {
        transcode = true;
        reason = DecisionReason::MandatoryExtension;
    }
    if settings
        .mandatory_codecs
        .iter()
        .any(|c| c.eq_ignore_ascii_case(&probe.codec))
    {
        transcode = true;
        reason = DecisionReason::MandatoryCodec;
    }

    Decision {
        transcode,
        applied_threshold,
        quality: Some(quality),
        reason,
    }
}
