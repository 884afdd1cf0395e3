use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use crate::batch::BatchStats;

/// Progress notifications emitted while a batch runs.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    BatchStarted { total: usize },
    KeyResolved,
    SegmentCompleted { index: usize, bytes: u64 },
    SegmentFailed { index: usize, error: String },
    BatchFinished { stats: BatchStats },
}

/// Callback invoked for every [`DownloadEvent`]. Called from worker tasks, so
/// it must be cheap and must not block.
pub type OnProgress = Arc<dyn Fn(DownloadEvent) + Send + Sync>;

/// Invokes the callback, if any. A panicking callback is logged and otherwise
/// ignored so progress reporting never changes the outcome of a download.
pub(crate) fn emit(on_progress: &Option<OnProgress>, event: DownloadEvent) {
    if let Some(callback) = on_progress {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            warn!("Progress callback panicked");
        }
    }
}
