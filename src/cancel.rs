//! Explicit cancellation signal.
//!
//! The pipeline never installs process-wide signal handlers. A caller that
//! wants Ctrl-C (or a supervisor) to stop a build hands a [`CancelToken`] to
//! the pipeline and flips it from wherever the interrupt arrives.
//!
//! Cancellation is observed between steps, between mirror attempts, and while
//! waiting on external commands (which are killed). The on-disk record is only
//! ever written at step boundaries, so a cancelled build resumes from the last
//! completed step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; visible to every clone.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
