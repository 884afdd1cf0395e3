//! # m3u8-dl engine
//!
//! Downloads every segment of an HLS media playlist concurrently, decrypts
//! AES-128 segments, and reassembles them into a single transport stream.
//!
//! ## Features
//!
//! - Bounded worker pool with in-order admission
//! - Retry with capped exponential backoff for transient failures
//! - One shared key per batch, published to workers once resolved
//! - Order-preserving reassembly regardless of completion order
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use m3u8_dl_engine::{
//!     BatchDownloader, CacheArea, DownloaderConfig, HttpTransport, fetch_playlist,
//!     merge_segments,
//! };
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(DownloaderConfig::builder().with_workers(8).build());
//! let transport = Arc::new(HttpTransport::new(&config)?);
//!
//! let url = Url::parse("https://example.com/vod/index.m3u8")?;
//! let playlist = fetch_playlist(transport.as_ref(), &url).await?;
//!
//! let cache = CacheArea::create_unique("cache").await?;
//! let stats = BatchDownloader::new(config, transport)
//!     .download(&playlist, &cache)
//!     .await?;
//! merge_segments(&cache, format!("{}.ts", cache.id())).await?;
//! println!("{stats}");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod builder;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod key;
pub mod merge;
pub mod playlist;
pub mod proxy;
pub mod transport;
pub mod worker;

pub use batch::{BatchCounters, BatchDownloader, BatchStats};
pub use builder::DownloaderConfigBuilder;
pub use cache::CacheArea;
pub use config::{DownloaderConfig, KeyWaitPolicy};
pub use crypto::{KeyMaterial, SegmentCipher, pkcs7_unpad, realign};
pub use error::{BatchError, DownloadError};
pub use events::{DownloadEvent, OnProgress};
pub use key::{KeyHandle, KeyResolver, KeyState};
pub use merge::{MergeSummary, merge_segments};
pub use playlist::{Playlist, SegmentDescriptor, fetch_playlist, parse_playlist};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use transport::{HttpTransport, RetryPolicy, SegmentFetch, create_client};
pub use worker::{SegmentOutcome, SegmentState, SegmentWorker};
