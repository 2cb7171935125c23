pub mod cancel;
pub mod candidate;
pub mod classify;
pub mod error;
pub mod hash;
pub mod index;
pub mod metadata;
pub mod organize;
pub mod relocate;
pub mod report;
pub mod resolve;
pub mod walk;

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use cancel::{CancellationToken, CancelledError};
pub use candidate::{Action, DestinationDecision, FileCandidate, MetadataRecord};
pub use classify::{PathClassifier, DEFAULT_TEMPLATE};
pub use error::{Error, ErrorKind};
pub use hash::Fingerprint;
pub use metadata::{DecodeError, ExifReader, MetadataReader};
pub use organize::Organizer;
pub use relocate::TransferMode;
pub use report::{Outcome, ReportEntry, RunReport};

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_suffix() -> u32 {
    resolve::DEFAULT_MAX_SUFFIX
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizeOptions {
    pub source: PathBuf,
    pub dest: PathBuf,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub dry_run: bool,
    /// Worker count; `None` means one per available core
    #[serde(default)]
    pub workers: Option<usize>,
    /// Index files already under the destination before processing
    #[serde(default = "default_true")]
    pub seed_from_destination: bool,
    #[serde(default)]
    pub mode: TransferMode,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_suffix")]
    pub max_suffix: u32,
}

impl Default for OrganizeOptions {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            dest: PathBuf::new(),
            template: default_template(),
            dry_run: false,
            workers: None,
            seed_from_destination: true,
            mode: TransferMode::default(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_suffix: default_max_suffix(),
        }
    }
}

impl OrganizeOptions {
    pub fn effective_workers(&self) -> usize {
        self.workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(4, |n| n.get()))
    }
}

/// Control options for a run (cancellation).
#[derive(Debug, Clone, Default)]
pub struct OrganizeControl {
    /// Cancellation token; workers stop picking up new files once set.
    pub cancel_token: Option<CancellationToken>,
}

impl OrganizeControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Progress callback: stage, current, total, message.
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

/// Called once per candidate, in completion order, as soon as its outcome is known.
pub type DecisionCallback = dyn Fn(&ReportEntry) + Send + Sync;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Throttled progress reporter. Emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        let start = Instant::now()
            .checked_sub(PROGRESS_INTERVAL)
            .unwrap_or_else(Instant::now);
        Self {
            inner,
            last_emit: Mutex::new(start),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < PROGRESS_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Organize `options.source` into `options.dest`.
pub fn organize(
    options: &OrganizeOptions,
    progress_callback: &ProgressCallback,
) -> Result<RunReport, Error> {
    organize_with_control(options, &OrganizeControl::default(), progress_callback, &|_: &ReportEntry| {})
}

/// Organize with cancellation support and a per-decision hook.
pub fn organize_with_control(
    options: &OrganizeOptions,
    control: &OrganizeControl,
    progress_callback: &ProgressCallback,
    decision_callback: &DecisionCallback,
) -> Result<RunReport, Error> {
    Organizer::new(options)?.run(control, progress_callback, decision_callback)
}
