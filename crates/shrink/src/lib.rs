pub mod config;
pub mod scan;
pub mod ffprobe;
pub mod classifier;
pub mod sidecar;
pub mod ledger;
pub mod guard;
pub mod report;
pub mod handbrake;
pub mod custody;
pub mod preflight;
pub mod pipeline;

pub use config::ShrinkConfig;
pub use ffprobe::{FfprobeCli, ProbeResult, Prober};
pub use classifier::{classify, Decision, DecisionReason};
pub use ledger::{FileLedger, Ledger};
pub use guard::{CrashGuard, MarkerFile};
pub use report::{FileReporter, Reporter};
pub use handbrake::{HandBrakeCli, Transcoder};
pub use pipeline::{Engine, Outcome, PipelineSettings, RunError, RunSummary};
