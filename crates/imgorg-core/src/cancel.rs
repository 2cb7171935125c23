use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Shared stop flag for a run. Clones observe the same flag, so the CLI's
/// Ctrl-C handler can hold one while the walker and workers poll another.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("run cancelled")]
pub struct CancelledError;

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err` once cancellation was requested, for use with `?`.
    pub fn check(&self) -> Result<(), CancelledError> {
        match self.is_cancelled() {
            true => Err(CancelledError),
            false => Ok(()),
        }
    }
}
