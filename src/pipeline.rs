//! Shared plumbing for the upload and download pipelines.
//!
//! Holds the cooperative cancellation token, the progress callback type,
//! the monotonic progress monitor and the RAII guard that removes
//! ciphertext temp files on every exit path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Callback receiving `(stage_label, percent)` updates.
///
/// Invoked from worker tasks; implementations must be cheap and must not
/// block.
pub type ProgressFn = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// Cooperative cancellation token shared by all workers of a pipeline.
///
/// Workers check the token at each loop iteration; the first failing
/// worker cancels it so its peers stop picking up new work.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Removes `path` when dropped, on success, error and panic paths alike.
///
/// The ciphertext temp files written next to user data must never survive
/// a run, whatever the outcome.
pub struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed ciphertext temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove temp file"),
        }
    }
}

/// Consumes completed chunk indices and forwards a non-decreasing
/// percentage to the progress callback.
///
/// Chunk completions arrive in any order; the reported value tracks the
/// highest index seen so far, so the sequence the callback observes never
/// decreases.
pub async fn monitor_progress(
    mut completions: mpsc::UnboundedReceiver<u64>,
    total: u64,
    label: &str,
    progress: ProgressFn,
) {
    let mut highest: Option<u64> = None;
    while let Some(index) = completions.recv().await {
        if highest.map_or(true, |h| index > h) {
            highest = Some(index);
            let percent = (((index + 1) * 100) / total.max(1)) as u8;
            progress(label, percent);
        }
    }
}
