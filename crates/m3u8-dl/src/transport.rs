// Transport: a single logical GET with bounded retry and exponential backoff.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::proxy::build_proxy_from_config;
use crate::{DownloadError, DownloaderConfig};

/// Source of raw bytes for segments and keys.
#[async_trait]
pub trait SegmentFetch: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Bytes, DownloadError>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .timeout(config.timeout)
        .redirect(reqwest::redirect::Policy::limited(10));

    if let Some(proxy_config) = &config.proxy {
        client_builder = client_builder.proxy(build_proxy_from_config(proxy_config)?);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy for downloads");
    }

    client_builder.build().map_err(DownloadError::from)
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloaderConfig) -> Self {
        Self {
            retries: config.retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Wait before `attempt` (0-based): nothing before the first attempt, then
    /// `base * 2^(attempt - 1)` capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` up to `retries + 1` times.
    ///
    /// Errors that are not retryable (see [`DownloadError::is_retryable`]) are
    /// returned as-is after the attempt that produced them. When every attempt
    /// fails, the last error is wrapped in [`DownloadError::RetryExhausted`].
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, DownloadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                result = op(attempt) => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Request failed, will retry");
                    last_error = Some(e);
                }
            }
        }

        Err(DownloadError::RetryExhausted {
            attempts: self.retries + 1,
            last_error: Box::new(
                last_error.unwrap_or_else(|| DownloadError::Internal("no attempt made".into())),
            ),
        })
    }
}

/// HTTP implementation of [`SegmentFetch`]. Holds no mutable state, so one
/// instance is shared by every worker of a batch.
pub struct HttpTransport {
    client: Client,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(config: &DownloaderConfig) -> Result<Self, DownloadError> {
        Ok(Self::with_client(create_client(config)?, config))
    }

    pub fn with_client(client: Client, config: &DownloaderConfig) -> Self {
        Self {
            client,
            retry: RetryPolicy::from_config(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight requests and backoff sleeps when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn fetch_once(&self, url: &Url) -> Result<Bytes, DownloadError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl SegmentFetch for HttpTransport {
    async fn fetch(&self, url: &Url) -> Result<Bytes, DownloadError> {
        let bytes = self
            .retry
            .run(&self.cancel, |_| self.fetch_once(url))
            .await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn server_error() -> DownloadError {
        DownloadError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            url: "http://test/seg.ts".to_string(),
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            retries: 10,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
        };

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(2), Duration::from_secs(6));
        assert_eq!(policy.delay_for(3), Duration::from_secs(12));
        assert_eq!(policy.delay_for(4), Duration::from_secs(24));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));

        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run(&CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(server_error())
                    } else {
                        Ok(Bytes::from_static(b"payload"))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, Bytes::from_static(b"payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = policy(5)
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Bytes, _>(DownloadError::Status {
                        status: StatusCode::FORBIDDEN,
                        url: "http://test/seg.ts".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let err = policy(2)
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<Bytes, _>(server_error()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            DownloadError::RetryExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryPolicy {
            retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let trigger = cancel.clone();
        let err = slow
            .run(&cancel, |_| {
                trigger.cancel();
                async { Err::<Bytes, _>(server_error()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
    }

    async fn spawn_server(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn test_config(retries: u32) -> DownloaderConfig {
        DownloaderConfig::builder()
            .with_retries(retries)
            .with_timeout(Duration::from_secs(5))
            .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_user_agent("test-agent")
            .build()
    }

    #[tokio::test]
    async fn test_http_fetch_retries_server_errors() {
        async fn flaky(State(hits): State<Arc<AtomicU32>>) -> (StatusCode, &'static str) {
            if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                (StatusCode::INTERNAL_SERVER_ERROR, "")
            } else {
                (StatusCode::OK, "test data")
            }
        }

        let hits = Arc::new(AtomicU32::new(0));
        let base = spawn_server(
            Router::new()
                .route("/seg.ts", get(flaky))
                .with_state(hits.clone()),
        )
        .await;

        let transport = HttpTransport::new(&test_config(3)).unwrap();
        let body = transport.fetch(&base.join("seg.ts").unwrap()).await.unwrap();

        assert_eq!(body, Bytes::from_static(b"test data"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_http_fetch_not_found_is_single_request() {
        async fn missing(State(hits): State<Arc<AtomicU32>>) -> StatusCode {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::NOT_FOUND
        }

        let hits = Arc::new(AtomicU32::new(0));
        let base = spawn_server(
            Router::new()
                .route("/gone.ts", get(missing))
                .with_state(hits.clone()),
        )
        .await;

        let transport = HttpTransport::new(&test_config(3)).unwrap();
        let err = transport
            .fetch(&base.join("gone.ts").unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_fetch_sends_user_agent() {
        async fn echo_agent(headers: axum::http::HeaderMap) -> String {
            headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        }

        let base = spawn_server(Router::new().route("/ua", get(echo_agent))).await;
        let transport = HttpTransport::new(&test_config(1)).unwrap();
        let body = transport.fetch(&base.join("ua").unwrap()).await.unwrap();

        assert_eq!(body, Bytes::from_static(b"test-agent"));
    }
}
