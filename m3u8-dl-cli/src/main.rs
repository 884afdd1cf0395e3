use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use error::AppError;
use m3u8_dl_engine::{
    BatchDownloader, BatchError, CacheArea, DownloaderConfig, HttpTransport, ProxyConfig,
    fetch_playlist, merge_segments,
};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use url::Url;

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use utils::build_headers;
use utils::progress::ProgressManager;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

fn build_config(args: &CliArgs) -> Result<DownloaderConfig, AppError> {
    let mut builder = DownloaderConfig::builder()
        .with_workers(args.workers)
        .with_retries(args.retries)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_key_wait(args.key_wait)
        .with_headers(build_headers(
            &args.headers,
            args.origin.as_deref(),
            args.referer.as_deref(),
        ));

    if let Some(user_agent) = &args.user_agent {
        builder = builder.with_user_agent(user_agent);
    }

    if let Some(proxy_url) = &args.proxy {
        let proxy = ProxyConfig::from_url(proxy_url)
            .map_err(|e| AppError::InvalidInput(e.to_string()))?;
        info!(
            proxy_url = %proxy.url,
            proxy_type = ?proxy.proxy_type,
            has_auth = proxy.auth.is_some(),
            "Using explicit proxy configuration for downloads"
        );
        builder = builder.with_proxy(proxy);
    }

    Ok(builder.build())
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("m3u8-dl.log")?;

    let multi_writer = MakeWriterExt::and(std::io::stdout, log_file);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(multi_writer)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("m3u8-dl {} - concurrent HLS segment downloader", env!("CARGO_PKG_VERSION"));
    info!("==================================================================");

    let playlist_url = Url::parse(&args.url)
        .map_err(|e| AppError::InvalidInput(format!("Invalid playlist URL '{}': {e}", args.url)))?;

    let config = Arc::new(build_config(&args)?);
    info!(
        workers = config.workers,
        retries = config.retries,
        timeout_s = config.timeout.as_secs(),
        key_wait = ?config.key_wait,
        "Downloader configuration"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling downloads");
                cancel.cancel();
            }
        });
    }

    let transport = Arc::new(HttpTransport::new(&config)?.with_cancellation(cancel.clone()));

    let playlist = fetch_playlist(transport.as_ref(), &playlist_url).await?;
    info!(
        segments = playlist.len(),
        encrypted = playlist.encrypted,
        "Playlist loaded"
    );

    let cache = CacheArea::create_unique(&args.cache_dir).await?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.ts", cache.id())));

    let progress_manager = if args.show_progress {
        ProgressManager::new()
    } else {
        ProgressManager::new_disabled()
    };

    let downloader = BatchDownloader::new(Arc::clone(&config), transport)
        .with_cancellation(cancel)
        .with_progress(Arc::new(move |event| {
            progress_manager.handle_event(event);
        }));

    let stats = match downloader.download(&playlist, &cache).await {
        Ok(stats) => stats,
        Err(e) => {
            if let Err(cleanup_error) = cache.cleanup().await {
                warn!(error = %cleanup_error, "Failed to remove cache directory");
            }
            if let BatchError::KeyResolution { stats, .. } = &e {
                error!(%stats, "Encryption key could not be loaded, nothing was merged");
            }
            return Err(e.into());
        }
    };

    let summary = merge_segments(&cache, &output).await?;
    info!(
        output = %output.display(),
        merged = summary.merged,
        skipped = summary.skipped,
        bytes = summary.bytes,
        "Output written"
    );

    if stats.all_failed() {
        return Err(AppError::AllSegmentsFailed(stats));
    }
    if stats.failed > 0 {
        warn!(%stats, "Some segments could not be downloaded, output has gaps");
    } else {
        info!(%stats, "Download complete");
    }

    Ok(())
}
