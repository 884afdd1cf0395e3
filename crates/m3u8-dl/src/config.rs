use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;

pub const DEFAULT_WORKERS: usize = 15;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// How a decrypting worker obtains the shared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum KeyWaitPolicy {
    /// Suspend until the key task publishes a key or an error.
    #[default]
    Wait,
    /// Check once; a segment that is ready before the key fails with `KeyNotLoaded`.
    Poll,
}

/// Immutable settings shared by every component of a batch run.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Maximum number of segments in flight
    pub workers: usize,

    /// Retries after the first attempt of each request
    pub retries: u32,

    /// Timeout for one HTTP request attempt
    pub timeout: Duration,

    /// First backoff delay, doubled on every further retry
    pub retry_base_delay: Duration,

    /// Upper bound for any single backoff delay
    pub retry_max_delay: Duration,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    pub key_wait: KeyWaitPolicy,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            key_wait: KeyWaitPolicy::default(),
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> crate::builder::DownloaderConfigBuilder {
        crate::builder::DownloaderConfigBuilder::new()
    }

    /// Replaces unset or out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = DEFAULT_WORKERS;
        }
        if self.retries == 0 {
            self.retries = DEFAULT_RETRIES;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.user_agent.trim().is_empty() {
            self.user_agent = DEFAULT_USER_AGENT.to_owned();
        }
        if self.retry_max_delay < self.retry_base_delay {
            self.retry_max_delay = self.retry_base_delay;
        }
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers
    }
}
