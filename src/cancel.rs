//! Cooperative cancellation
//!
//! Long-running loops poll a shared [`CancelFlag`] at each iteration and bail
//! out with [`BackupError::Cancelled`] once it is raised. Clones share state,
//! so a host can keep one handle and hand the others to worker threads.

use crate::error::{BackupError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation signal
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a flag that is not raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every operation holding this flag
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Lower the flag again so the holder can be reused
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Return [`BackupError::Cancelled`] if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }
}
