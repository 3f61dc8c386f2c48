//! Persistence and HTTP plumbing for the vote-match pipeline.
//!
//! * [`HttpFetcher`]: JSON GET/POST over a timeout-bounded `reqwest` client.
//! * [`retry_with`]: the bounded-retry combinator shared by upstream and
//!   generative-service callers.
//! * [`PollStore`]: idempotent, upsert-only persistence of polls, tallies,
//!   questions, citizen ballots and run leases.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

mod postgres;
mod store;

pub use postgres::PgPollStore;
pub use store::{MemoryPollStore, PollFilter, PollStore, StoreError};

pub const CRATE_NAME: &str = "votematch-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// How often and how patiently to repeat a fallible operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay after the attempt with the given zero-based index failed.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

/// Run `op` until it succeeds, `classify` marks its error non-retryable, or
/// `policy.max_attempts` attempts have been made. `op` receives the 1-based
/// attempt number. The error of the final attempt is returned.
pub async fn retry_with<T, E, F, Fut, C>(policy: &RetryPolicy, mut op: F, classify: C) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == RetryDisposition::NonRetryable {
                    debug!(attempt, error = %err, "non-retryable failure");
                    return Err(err);
                }
                if attempt >= max_attempts {
                    warn!(attempt, error = %err, "giving up after final attempt");
                    return Err(err);
                }
                warn!(attempt, max_attempts, error = %err, "attempt failed; retrying");
                let delay = policy.delay_for_attempt(attempt - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Limits how many outgoing calls may start per refill interval.
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            state: Mutex::new((config.capacity, Instant::now())),
            config,
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last_refill) = &mut *state;
                let interval = self.config.refill_every;
                if !interval.is_zero() {
                    let refills = (last_refill.elapsed().as_nanos() / interval.as_nanos()) as u32;
                    if refills > 0 {
                        *tokens = tokens.saturating_add(refills).min(self.config.capacity);
                        *last_refill += interval * refills;
                    }
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                interval.saturating_sub(last_refill.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { source, .. } if source.is_timeout())
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Thin JSON client. Performs exactly one request per call; retrying is the
/// caller's decision.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<TokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            token_bucket: config.token_bucket.map(|c| Arc::new(TokenBucket::new(c))),
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let span = info_span!("http_get", url);
        async {
            self.throttle().await;
            let resp = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|source| request_failed(url, source))?;
            read_json(url, resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
        extra_headers: &[(&'static str, String)],
        body: &B,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_post", url);
        async {
            self.throttle().await;
            let mut headers = HeaderMap::new();
            if let Some(token) = bearer {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            for (name, value) in extra_headers {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.insert(HeaderName::from_static(name), value);
                }
            }
            let resp = self
                .client
                .post(url)
                .headers(headers)
                .json(body)
                .send()
                .await
                .map_err(|source| request_failed(url, source))?;
            read_json(url, resp).await
        }
        .instrument(span)
        .await
    }

    async fn throttle(&self) {
        if let Some(bucket) = &self.token_bucket {
            bucket.acquire().await;
        }
    }
}

fn request_failed(url: &str, source: reqwest::Error) -> FetchError {
    let err = FetchError::Request {
        url: url.to_string(),
        source,
    };
    if err.is_timeout() {
        warn!(url, "request timed out");
    } else {
        debug!(url, error = %err, "request failed");
    }
    err
}

async fn read_json<T: DeserializeOwned>(url: &str, resp: reqwest::Response) -> Result<T, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let bytes = resp.bytes().await.map_err(|source| request_failed(url, source))?;
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
            body: String::from_utf8_lossy(&bytes).chars().take(512).collect(),
        });
    }
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode { url: final_url, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn classify(err: &TestError) -> RetryDisposition {
        match err {
            TestError::Flaky => RetryDisposition::Retryable,
            TestError::Fatal => RetryDisposition::NonRetryable,
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff: Backoff::Exponential,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        let fixed = RetryPolicy::fixed(3, Duration::from_secs(1));
        assert_eq!(fixed.delay_for_attempt(2), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = retry_with(
            &RetryPolicy::fixed(3, Duration::ZERO),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Flaky) }
            },
            classify,
        )
        .await;
        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let result = retry_with(
            &RetryPolicy::fixed(5, Duration::ZERO),
            |attempt| async move {
                if attempt < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok(attempt)
                }
            },
            classify,
        )
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn non_retryable_errors_abort_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = retry_with(
            &RetryPolicy::fixed(3, Duration::ZERO),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            },
            classify,
        )
        .await;
        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempt_policy_still_runs_once() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::once()
        };
        let _ = retry_with(
            &policy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Flaky) }
            },
            classify,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_allows_burst_up_to_capacity() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_secs(1),
        });
        let start = tokio::time::Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 503,
            url: "u".into(),
            body: String::new(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert!(!err.is_timeout());
    }
}
