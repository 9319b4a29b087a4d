//! Progress reporting for region builds.
//!
//! [`ProgressCallback`] decouples build progress from how it is rendered.
//! [`LogProgress`] writes through the `log` facade; [`NullProgress`] is
//! silent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for reporting progress from long-running operations.
///
/// Implementations must be `Send + Sync` to support use across spawned
/// tokio tasks and `Arc`-based sharing.
pub trait ProgressCallback: Send + Sync {
    /// Set the total expected units of work.
    fn set_total(&self, total: u64);

    /// Advance progress by `delta` units.
    fn inc(&self, delta: u64);

    /// Update the message displayed alongside the progress indicator.
    fn set_message(&self, msg: String);

    /// Mark progress as complete with a final message.
    fn finish(&self, msg: String);
}

/// A no-op implementation of [`ProgressCallback`].
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`] instance for convenient use.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}

/// Logs `label: position/total` lines at `info` level.
pub struct LogProgress {
    label: String,
    total: AtomicU64,
    position: AtomicU64,
}

impl LogProgress {
    /// Creates a logger prefixed with `label`.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            total: AtomicU64::new(0),
            position: AtomicU64::new(0),
        }
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }
}

impl ProgressCallback for LogProgress {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.position.store(0, Ordering::Relaxed);
    }

    fn inc(&self, delta: u64) {
        let pos = self.position.fetch_add(delta, Ordering::Relaxed) + delta;
        let total = self.total.load(Ordering::Relaxed);
        log::info!("{}: {pos}/{total}", self.label);
    }

    fn set_message(&self, msg: String) {
        log::info!("{}: {msg}", self.label);
    }

    fn finish(&self, msg: String) {
        log::info!("{}: done, {msg}", self.label);
    }
}
