use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Returned by a job that stopped because its token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("job cancelled by user")]
pub struct JobCancelled;

/// Cooperative cancellation handle shared between the owning service and a job.
///
/// Cancelling is a request: the job observes it at its own poll points
/// (`is_cancelled` / `checkpoint`). Pausing parks the job inside `checkpoint`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Blocks while paused, then reports cancellation. Call from worker threads only.
    pub fn checkpoint(&self) -> Result<(), JobCancelled> {
        while self.is_paused() && !self.is_cancelled() {
            std::thread::sleep(PAUSE_POLL);
        }
        if self.is_cancelled() {
            return Err(JobCancelled);
        }
        Ok(())
    }
}
