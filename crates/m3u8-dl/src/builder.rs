//! # Builder for DownloaderConfig
//!
//! Fluent construction of the single [`DownloaderConfig`] record a batch run is
//! started with. `build()` normalizes the result, so unset counts and timeouts
//! fall back to their defaults.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use m3u8_dl_engine::DownloaderConfig;
//!
//! let config = DownloaderConfig::builder()
//!     .with_workers(8)
//!     .with_retries(5)
//!     .with_timeout(Duration::from_secs(20))
//!     .with_user_agent("MyApp/1.0")
//!     .with_header("Referer", "https://example.com/")
//!     .build();
//!
//! assert_eq!(config.workers, 8);
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::{DownloaderConfig, KeyWaitPolicy, proxy::ProxyConfig};

/// Builder for creating DownloaderConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: DownloaderConfig::default(),
        }
    }

    /// Set the number of concurrent segment workers (0 selects the default)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the number of retries after the first attempt (0 selects the default)
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set the timeout for one request attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the base and ceiling of the exponential retry backoff
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = max;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header; invalid names or values are ignored
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Merge headers into the current set, overriding entries with the same name
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.config.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Set the proxy configuration
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Choose how decrypting workers wait for the key
    pub fn with_key_wait(mut self, policy: KeyWaitPolicy) -> Self {
        self.config.key_wait = policy;
        self
    }

    /// Build the DownloaderConfig instance
    pub fn build(self) -> DownloaderConfig {
        self.config.normalized()
    }
}

impl Default for DownloaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
