use reqwest::StatusCode;

use crate::batch::BatchStats;

// Error type for a single fetch, key or segment operation
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP error: status {status} for URL {url}")]
    Status { status: StatusCode, url: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: Box<DownloadError>,
    },

    #[error("Invalid decryption key: {0}")]
    InvalidKey(String),

    #[error("AES decryption failed: {0}")]
    DecryptFailed(String),

    #[error("Encryption key not loaded")]
    KeyNotLoaded,

    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Playlist error: {0}")]
    Playlist(String),

    #[error("Invalid URL: {0}")]
    UrlError(String),

    #[error("Invalid proxy configuration: {0}")]
    ProxyError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DownloadError {
    /// Whether another attempt at the same request could succeed.
    ///
    /// Client errors (4xx) are terminal; everything the server or the network
    /// might recover from is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Status { status, .. } => !status.is_client_error(),
            DownloadError::Network(e) => !e.is_builder(),
            DownloadError::Io(_) => true,
            _ => false,
        }
    }

    /// HTTP status carried by this error, looking through retry exhaustion.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DownloadError::Status { status, .. } => Some(*status),
            DownloadError::Network(e) => e.status(),
            DownloadError::RetryExhausted { last_error, .. } => last_error.status(),
            _ => None,
        }
    }
}

// Error type for a whole batch run. Segment failures are not errors here, they
// are reported through `BatchStats::failed`.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Invalid playlist: {0}")]
    InvalidPlaylist(String),

    #[error("Failed to download encryption key: {source}")]
    KeyResolution {
        stats: BatchStats,
        #[source]
        source: DownloadError,
    },

    #[error("Batch cancelled ({stats})")]
    Cancelled { stats: BatchStats },
}

impl BatchError {
    /// Partial statistics accumulated before the batch failed, if any work ran.
    pub fn stats(&self) -> Option<&BatchStats> {
        match self {
            BatchError::InvalidPlaylist(_) => None,
            BatchError::KeyResolution { stats, .. } | BatchError::Cancelled { stats } => {
                Some(stats)
            }
        }
    }
}
