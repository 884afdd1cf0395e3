use m3u8_dl_engine::BatchStats;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] m3u8_dl_engine::DownloadError),

    #[error("Batch error: {0}")]
    Batch(#[from] m3u8_dl_engine::BatchError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Every segment failed ({0})")]
    AllSegmentsFailed(BatchStats),
}
