//! Request scheduling for upstream message sources: per-source rate limiting,
//! retry classification, exponential backoff and a JSON HTTP client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use scribe_core::Source;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "scribe-storage";

/// Ceiling for any server-imposed retry-after.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff bounded by `max_attempts` total tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

/// Provider quota expressed as `requests` per rolling `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }

    fn refill_every(&self) -> Duration {
        self.window / self.requests.max(1)
    }
}

#[derive(Debug, Clone, Error)]
#[error("timed out waiting for {upstream} rate-limit budget after {waited:?}")]
pub struct RateLimitTimeout {
    pub upstream: Source,
    pub waited: Duration,
}

/// Proof that a request slot was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePermit {
    pub source: Source,
    pub waited: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket for one source.
///
/// Waiters queue on `turnstile`, a fair mutex, so permits are granted in
/// arrival order; the holder sleeps until a token or the server-imposed block
/// clears, then releases the turnstile to the next waiter.
#[derive(Debug)]
struct SourceLimiter {
    capacity: u32,
    refill_every: Duration,
    turnstile: Mutex<BucketState>,
    blocked_until: StdMutex<Option<Instant>>,
}

impl SourceLimiter {
    fn new(config: RateLimitConfig) -> Self {
        let capacity = config.requests.max(1);
        Self {
            capacity,
            refill_every: config.refill_every(),
            turnstile: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            blocked_until: StdMutex::new(None),
        }
    }

    fn blocked_until(&self) -> Option<Instant> {
        *self
            .blocked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn block_for(&self, retry_after: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(retry_after.min(MAX_RETRY_AFTER))
            .unwrap_or(now);
        let mut blocked = self
            .blocked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *blocked = Some(blocked.map_or(until, |current| current.max(until)));
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if state.tokens >= self.capacity || self.refill_every.is_zero() {
            state.tokens = self.capacity;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
        if refills == 0 {
            return;
        }
        let refills = refills.min(u128::from(self.capacity)) as u32;
        state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
        if state.tokens >= self.capacity {
            state.last_refill = now;
        } else {
            state.last_refill += self.refill_every * refills;
        }
    }

    async fn take(&self) {
        let mut state = self.turnstile.lock().await;
        loop {
            let now = Instant::now();
            if let Some(until) = self.blocked_until() {
                if until > now {
                    tokio::time::sleep_until(until).await;
                    continue;
                }
            }

            self.refill(&mut state, now);
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let next = state.last_refill + self.refill_every;
            tokio::time::sleep_until(next.max(now)).await;
        }
    }
}

/// Process-wide request budget, one bucket per rate-limited source.
///
/// Sources without a configured quota are granted immediately.
#[derive(Debug, Default)]
pub struct RateLimiter {
    limits: HashMap<Source, Arc<SourceLimiter>>,
}

impl RateLimiter {
    pub fn new(configs: impl IntoIterator<Item = (Source, RateLimitConfig)>) -> Self {
        Self {
            limits: configs
                .into_iter()
                .map(|(source, config)| (source, Arc::new(SourceLimiter::new(config))))
                .collect(),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_limited(&self, source: Source) -> bool {
        self.limits.contains_key(&source)
    }

    /// Wait for a request slot, failing only once `deadline` passes.
    pub async fn acquire(
        &self,
        source: Source,
        deadline: Option<Instant>,
    ) -> Result<RatePermit, RateLimitTimeout> {
        let started = Instant::now();
        let Some(limiter) = self.limits.get(&source) else {
            return Ok(RatePermit {
                source,
                waited: Duration::ZERO,
            });
        };

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, limiter.take())
                .await
                .map_err(|_| RateLimitTimeout {
                    upstream: source,
                    waited: started.elapsed(),
                })?,
            None => limiter.take().await,
        }

        let waited = started.elapsed();
        if waited >= Duration::from_secs(1) {
            debug!(%source, waited_ms = waited.as_millis() as u64, "rate-limit permit granted after wait");
        }
        Ok(RatePermit { source, waited })
    }

    /// Apply a server retry-after signal; it overrides the local token estimate.
    pub fn penalize(&self, source: Source, retry_after: Duration) {
        match self.limits.get(&source) {
            Some(limiter) => {
                warn!(%source, retry_after_ms = retry_after.as_millis() as u64, "upstream requested retry-after");
                limiter.block_for(retry_after);
            }
            None => debug!(%source, "retry-after for unlimited source ignored"),
        }
    }

    /// Remaining server-imposed block for `source`, if any.
    pub fn blocked_for(&self, source: Source) -> Option<Duration> {
        let until = self.limits.get(&source)?.blocked_until()?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }
}

/// Parse retry-after from a 429 response.
///
/// Prefers the JSON `retry_after` seconds Discord sends, then
/// `X-RateLimit-Reset-After`, then a standard `Retry-After` header in either
/// delta-seconds or HTTP-date form.
pub fn parse_retry_after(headers: &HeaderMap, body: Option<&JsonValue>) -> Option<Duration> {
    if let Some(secs) = body
        .and_then(|b| b.get("retry_after"))
        .and_then(JsonValue::as_f64)
    {
        return duration_from_secs(secs);
    }
    if let Some(secs) = header_str(headers, "x-ratelimit-reset-after").and_then(|s| s.parse().ok())
    {
        return duration_from_secs(secs);
    }
    let raw = header_str(headers, "retry-after")?;
    if let Ok(secs) = raw.parse::<f64>() {
        return duration_from_secs(secs);
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some(
        (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_RETRY_AFTER),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

fn duration_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_AFTER)
            .min(MAX_RETRY_AFTER),
    )
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rate limited by {url} (retry after {retry_after:?})")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("http status {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            HttpError::Transport(err) => classify_reqwest_error(err),
            HttpError::RateLimited { .. } | HttpError::Decode { .. } => RetryDisposition::Retryable,
            HttpError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            HttpError::Transport(err) => err.status().map(|s| s.as_u16()),
            HttpError::Decode { .. } => None,
        }
    }
}

/// Single-shot JSON GET client; retries belong to the caller so every attempt
/// can pass through the rate limiter first.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpClient {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<JsonValue, HttpError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");

        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let resp_headers = resp.headers().clone();
            let bytes = resp.bytes().await?;

            if status.is_success() {
                return serde_json::from_slice(&bytes).map_err(|source| HttpError::Decode {
                    url: url.to_string(),
                    source,
                });
            }

            let body_json: Option<JsonValue> = serde_json::from_slice(&bytes).ok();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(HttpError::RateLimited {
                    url: url.to_string(),
                    retry_after: parse_retry_after(&resp_headers, body_json.as_ref()),
                });
            }

            let body = String::from_utf8_lossy(&bytes).chars().take(512).collect();
            Err(HttpError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            })
        }
        .instrument(info_span!("http_get", url))
        .await
    }
}
