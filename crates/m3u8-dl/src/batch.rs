// Batch orchestrator: bounded fan-out of segment workers plus the key resolver.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheArea;
use crate::config::DownloaderConfig;
use crate::error::{BatchError, DownloadError};
use crate::events::{DownloadEvent, OnProgress, emit};
use crate::key::KeyResolver;
use crate::playlist::Playlist;
use crate::transport::SegmentFetch;
use crate::worker::{SegmentOutcome, SegmentState, SegmentWorker};

/// Final tally of a batch. `completed + failed == total` once the batch has
/// returned, including after cancellation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl BatchStats {
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} segments completed, {} failed in {:.2?}",
            self.completed, self.total, self.failed, self.elapsed
        )
    }
}

/// Counters shared by the worker tasks of one batch.
#[derive(Debug, Default)]
pub struct BatchCounters {
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchCounters {
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, count: usize) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, total: usize, elapsed: Duration) -> BatchStats {
        BatchStats {
            total,
            completed: self.completed(),
            failed: self.failed(),
            elapsed,
        }
    }
}

/// Downloads every segment of a playlist into a [`CacheArea`].
pub struct BatchDownloader {
    config: Arc<DownloaderConfig>,
    fetcher: Arc<dyn SegmentFetch>,
    on_progress: Option<OnProgress>,
    cancel: CancellationToken,
}

impl BatchDownloader {
    pub fn new(config: Arc<DownloaderConfig>, fetcher: Arc<dyn SegmentFetch>) -> Self {
        Self {
            config,
            fetcher,
            on_progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, on_progress: OnProgress) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the batch to completion.
    ///
    /// Segment failures are counted, not returned: the result is `Ok` even when
    /// some or all segments failed. An error is returned only for an invalid
    /// playlist, a key that could not be resolved, or cancellation, and in the
    /// latter two cases only after every spawned task has joined.
    pub async fn download(
        &self,
        playlist: &Playlist,
        cache: &CacheArea,
    ) -> Result<BatchStats, BatchError> {
        playlist
            .validate()
            .map_err(|e| BatchError::InvalidPlaylist(e.to_string()))?;

        let started = Instant::now();
        let total = playlist.len();
        let workers = self.config.workers.max(1);
        info!(
            total,
            workers,
            encrypted = playlist.encrypted,
            cache = %cache.dir().display(),
            "Starting batch download"
        );
        emit(&self.on_progress, DownloadEvent::BatchStarted { total });

        let (key, key_task) = match (playlist.encrypted, &playlist.key_url) {
            (true, Some(key_url)) => {
                let (handle, task) =
                    KeyResolver::new(Arc::clone(&self.fetcher), key_url.clone(), playlist.iv)
                        .with_cancellation(self.cancel.clone())
                        .with_progress(self.on_progress.clone())
                        .spawn();
                (Some(handle), Some(task))
            }
            _ => (None, None),
        };

        let worker = SegmentWorker::new(Arc::clone(&self.fetcher), key, self.config.key_wait)
            .with_cancellation(self.cancel.clone());
        let counters = Arc::new(BatchCounters::default());
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut dispatched = 0usize;

        for segment in &playlist.segments {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            dispatched += 1;

            let worker = worker.clone();
            let segment = segment.clone();
            let path = cache.segment_path(&segment);
            let counters = Arc::clone(&counters);
            let on_progress = self.on_progress.clone();
            debug!(index = segment.index, state = %SegmentState::Pending, "Segment admitted");

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = worker.run(&segment, path).await;
                match &outcome {
                    SegmentOutcome::Completed { index, bytes, .. } => {
                        counters.record_completed();
                        emit(
                            &on_progress,
                            DownloadEvent::SegmentCompleted {
                                index: *index,
                                bytes: *bytes,
                            },
                        );
                    }
                    SegmentOutcome::Failed { index, error } => {
                        counters.record_failed(1);
                        emit(
                            &on_progress,
                            DownloadEvent::SegmentFailed {
                                index: *index,
                                error: error.to_string(),
                            },
                        );
                    }
                }
                outcome
            });
        }

        let undispatched = total - dispatched;
        if undispatched > 0 {
            warn!(undispatched, "Batch cancelled before all segments were dispatched");
            counters.record_failed(undispatched);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Segment task aborted");
                counters.record_failed(1);
            }
        }

        let key_result = match key_task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(DownloadError::Internal(format!("key task failed: {e}"))),
            },
            None => Ok(()),
        };

        let stats = counters.snapshot(total, started.elapsed());
        emit(&self.on_progress, DownloadEvent::BatchFinished { stats });

        if self.cancel.is_cancelled() {
            warn!(%stats, "Batch cancelled");
            return Err(BatchError::Cancelled { stats });
        }
        if let Err(source) = key_result {
            error!(%stats, error = %source, "Batch failed to resolve encryption key");
            return Err(BatchError::KeyResolution { stats, source });
        }

        if stats.failed > 0 {
            warn!(%stats, "Batch finished with failed segments");
        } else {
            info!(%stats, "Batch finished");
        }
        Ok(stats)
    }
}
