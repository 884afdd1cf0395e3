// Key Resolver: fetches the batch key once and publishes the cipher to every worker.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::DownloadError;
use crate::config::KeyWaitPolicy;
use crate::crypto::{BLOCK_SIZE, KeyMaterial, SegmentCipher};
use crate::events::{DownloadEvent, OnProgress, emit};
use crate::transport::SegmentFetch;

/// Publication state of the batch key. Moves from `Pending` to exactly one of
/// the terminal states and never changes afterwards.
#[derive(Debug, Clone)]
pub enum KeyState {
    Pending,
    Ready(Arc<SegmentCipher>),
    Failed(String),
}

impl KeyState {
    fn is_settled(&self) -> bool {
        !matches!(self, KeyState::Pending)
    }
}

/// Cloneable read side of the key publication.
#[derive(Debug, Clone)]
pub struct KeyHandle {
    rx: watch::Receiver<KeyState>,
}

impl KeyHandle {
    /// Handle whose key is already available.
    pub fn ready(cipher: SegmentCipher) -> Self {
        let (_tx, rx) = watch::channel(KeyState::Ready(Arc::new(cipher)));
        Self { rx }
    }

    pub fn state(&self) -> KeyState {
        self.rx.borrow().clone()
    }

    /// Returns the cipher if it has been published, without waiting.
    pub fn try_cipher(&self) -> Result<Arc<SegmentCipher>, DownloadError> {
        settled_cipher(&self.rx.borrow())
    }

    /// Waits until the key is published or has failed.
    pub async fn cipher(&self) -> Result<Arc<SegmentCipher>, DownloadError> {
        let mut rx = self.rx.clone();
        let state = rx.wait_for(KeyState::is_settled).await.map_err(|_| {
            DownloadError::KeyUnavailable("key resolver stopped before publishing".to_string())
        })?;
        settled_cipher(&state)
    }

    pub async fn acquire(
        &self,
        policy: KeyWaitPolicy,
    ) -> Result<Arc<SegmentCipher>, DownloadError> {
        match policy {
            KeyWaitPolicy::Wait => self.cipher().await,
            KeyWaitPolicy::Poll => self.try_cipher(),
        }
    }
}

fn settled_cipher(state: &KeyState) -> Result<Arc<SegmentCipher>, DownloadError> {
    match state {
        KeyState::Pending => Err(DownloadError::KeyNotLoaded),
        KeyState::Ready(cipher) => Ok(Arc::clone(cipher)),
        KeyState::Failed(reason) => Err(DownloadError::KeyUnavailable(reason.clone())),
    }
}

pub struct KeyResolver {
    fetcher: Arc<dyn SegmentFetch>,
    key_url: Url,
    iv: Option<[u8; BLOCK_SIZE]>,
    cancel: CancellationToken,
    on_progress: Option<OnProgress>,
}

impl KeyResolver {
    pub fn new(fetcher: Arc<dyn SegmentFetch>, key_url: Url, iv: Option<[u8; BLOCK_SIZE]>) -> Self {
        Self {
            fetcher,
            key_url,
            iv,
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, on_progress: Option<OnProgress>) -> Self {
        self.on_progress = on_progress;
        self
    }

    /// Fetches the key and builds the cipher.
    pub async fn resolve(&self) -> Result<SegmentCipher, DownloadError> {
        debug!(url = %self.key_url, "Fetching encryption key");
        let key = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            key = self.fetcher.fetch(&self.key_url) => key?,
        };
        let material = KeyMaterial::new(key, self.iv)?;
        SegmentCipher::new(&material)
    }

    /// Runs [`KeyResolver::resolve`] on its own task and publishes the result.
    ///
    /// The task's own result carries the underlying error so the orchestrator
    /// can report it once every worker has joined.
    pub fn spawn(self) -> (KeyHandle, JoinHandle<Result<(), DownloadError>>) {
        let (tx, rx) = watch::channel(KeyState::Pending);

        let task = tokio::spawn(async move {
            match self.resolve().await {
                Ok(cipher) => {
                    info!(url = %self.key_url, "Encryption key loaded");
                    tx.send_replace(KeyState::Ready(Arc::new(cipher)));
                    emit(&self.on_progress, DownloadEvent::KeyResolved);
                    Ok(())
                }
                Err(e) => {
                    error!(url = %self.key_url, error = %e, "Failed to load encryption key");
                    tx.send_replace(KeyState::Failed(e.to_string()));
                    Err(e)
                }
            }
        });

        (KeyHandle { rx }, task)
    }
}
