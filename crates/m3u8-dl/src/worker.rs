// Segment Worker: drives one segment from fetch to its cache file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::DownloadError;
use crate::config::KeyWaitPolicy;
use crate::crypto::{SegmentCipher, realign_bytes};
use crate::key::KeyHandle;
use crate::playlist::SegmentDescriptor;
use crate::transport::SegmentFetch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    Fetching,
    Decrypting,
    Realigning,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentState::Pending => "pending",
            SegmentState::Fetching => "fetching",
            SegmentState::Decrypting => "decrypting",
            SegmentState::Realigning => "realigning",
            SegmentState::Persisting => "persisting",
            SegmentState::Done => "done",
            SegmentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum SegmentOutcome {
    Completed {
        index: usize,
        path: PathBuf,
        bytes: u64,
    },
    Failed {
        index: usize,
        error: DownloadError,
    },
}

impl SegmentOutcome {
    pub fn index(&self) -> usize {
        match self {
            SegmentOutcome::Completed { index, .. } | SegmentOutcome::Failed { index, .. } => {
                *index
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SegmentOutcome::Completed { .. })
    }
}

/// Shared per-batch worker context; one [`SegmentWorker::run`] call per segment.
#[derive(Clone)]
pub struct SegmentWorker {
    fetcher: Arc<dyn SegmentFetch>,
    key: Option<KeyHandle>,
    key_wait: KeyWaitPolicy,
    cancel: CancellationToken,
}

impl SegmentWorker {
    pub fn new(
        fetcher: Arc<dyn SegmentFetch>,
        key: Option<KeyHandle>,
        key_wait: KeyWaitPolicy,
    ) -> Self {
        Self {
            fetcher,
            key,
            key_wait,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fetches, decrypts when a key is configured, realigns and writes the
    /// segment to `path`. Never panics on segment errors; they are returned
    /// as [`SegmentOutcome::Failed`].
    pub async fn run(&self, segment: &SegmentDescriptor, path: PathBuf) -> SegmentOutcome {
        let index = segment.index;
        match self.process(segment, &path).await {
            Ok(bytes) => {
                debug!(index, bytes, state = %SegmentState::Done, "Segment stored");
                SegmentOutcome::Completed { index, path, bytes }
            }
            Err(error) => {
                error!(
                    index,
                    url = %segment.url,
                    state = %SegmentState::Failed,
                    error = %error,
                    "Segment failed"
                );
                SegmentOutcome::Failed { index, error }
            }
        }
    }

    async fn process(
        &self,
        segment: &SegmentDescriptor,
        path: &Path,
    ) -> Result<u64, DownloadError> {
        let index = segment.index;

        debug!(index, url = %segment.url, state = %SegmentState::Fetching, "Segment transition");
        let mut data = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            data = self.fetcher.fetch(&segment.url) => data?,
        };

        if let Some(key) = &self.key {
            debug!(index, state = %SegmentState::Decrypting, "Segment transition");
            let cipher = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                cipher = key.acquire(self.key_wait) => cipher?,
            };
            data = decrypt_blocking(cipher, data).await?;
        }

        debug!(index, state = %SegmentState::Realigning, "Segment transition");
        let data = realign_bytes(data);

        debug!(index, state = %SegmentState::Persisting, "Segment transition");
        if let Err(e) = persist(path, &data).await {
            // A partial file would otherwise be picked up by the merger.
            let _ = tokio::fs::remove_file(path).await;
            return Err(e);
        }

        Ok(data.len() as u64)
    }
}

async fn decrypt_blocking(
    cipher: Arc<SegmentCipher>,
    data: Bytes,
) -> Result<Bytes, DownloadError> {
    tokio::task::spawn_blocking(move || cipher.decrypt(&data))
        .await
        .map_err(|e| DownloadError::Internal(format!("decrypt task failed: {e}")))?
        .map(Bytes::from)
}

async fn persist(path: &Path, data: &[u8]) -> Result<(), DownloadError> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}
