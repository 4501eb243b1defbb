//! Rate-limited retry client
//!
//! Executes one logical request against a provider API. A counting semaphore
//! bounds the number of logical fetches in flight; the permit is held across
//! every retry of that fetch. Retries cover transport failures and the
//! statuses in [`RETRYABLE_STATUSES`], honouring `Retry-After` when present
//! and otherwise backing off exponentially up to the configured maximum.
//!
//! The client never touches persisted state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::ProviderConfig;
use crate::error::{ApiError, FetchError, IngestError, RETRYABLE_STATUSES};

/// Attempt ceiling for one logical request
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

/// Exponential delay sequence, doubled only when actually used
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// Delay to sleep now; the following call returns double (capped)
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Parse a `Retry-After` header as delta seconds or an HTTP-date
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    // A date already in the past means "retry now"
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// One logical GET request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub accept: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            accept: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn accept(mut self, mime: impl Into<String>) -> Self {
        self.accept = Some(mime.into());
        self
    }

    /// Fully resolved URL including the query string
    pub fn resolved_url(&self) -> Result<Url, FetchError> {
        Url::parse_with_params(&self.url, &self.query)
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", self.url, e)))
    }
}

/// A successful (2xx) response, fully read
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub attempts: u32,
}

impl FetchedResponse {
    pub fn payload_bytes(&self) -> usize {
        self.body.len()
    }

    pub fn json<T: DeserializeOwned>(&self, target: &str) -> Result<T, FetchError> {
        serde_json::from_str(&self.body).map_err(|e| FetchError::decode(target, e.to_string()))
    }
}

struct RawResponse {
    status: u16,
    headers: HeaderMap,
    body: String,
}

/// Bounded-concurrency HTTP executor shared by one provider's run
pub struct RetryClient {
    http: reqwest::Client,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    auth_token: Option<String>,
}

impl RetryClient {
    pub fn new(config: &ProviderConfig, user_agent: &str) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            http,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            policy: RetryPolicy::from_config(config),
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Execute `request`, retrying per the policy until success, a permanent
    /// failure, the attempt ceiling, or cancellation.
    pub async fn send(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let url = request.resolved_url()?;
        let display_url = url.to_string();

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = self.semaphore.acquire() => permit.map_err(|_| FetchError::Cancelled)?,
        };

        let mut backoff = Backoff::new(self.policy.initial_backoff, self.policy.max_backoff);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = self.attempt(&url, request) => result,
            };

            let delay = match result {
                Ok(raw) if (200..300).contains(&raw.status) => {
                    debug!(
                        url = %display_url,
                        status = raw.status,
                        attempt,
                        bytes = raw.body.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Request succeeded"
                    );
                    return Ok(FetchedResponse {
                        url: display_url,
                        status: raw.status,
                        body: raw.body,
                        attempts: attempt,
                    });
                },
                Ok(raw) => {
                    if !RETRYABLE_STATUSES.contains(&raw.status) {
                        debug!(url = %display_url, status = raw.status, "Permanent HTTP failure");
                        return Err(
                            ApiError::status(display_url, raw.status, Some(raw.body), attempt).into()
                        );
                    }
                    if attempt >= self.policy.max_attempts {
                        return Err(
                            ApiError::status(display_url, raw.status, Some(raw.body), attempt).into()
                        );
                    }
                    let delay = match parse_retry_after(&raw.headers, Utc::now()) {
                        Some(server_delay) => server_delay,
                        None => backoff.next_delay(),
                    };
                    warn!(
                        url = %display_url,
                        status = raw.status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable response, backing off"
                    );
                    delay
                },
                Err(e) => {
                    let timed_out = e.is_timeout();
                    if attempt >= self.policy.max_attempts {
                        return Err(ApiError::transport(display_url, attempt, timed_out).into());
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        url = %display_url,
                        attempt,
                        timed_out,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport failure, backing off"
                    );
                    delay
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    async fn attempt(&self, url: &Url, request: &FetchRequest) -> Result<RawResponse, reqwest::Error> {
        let mut builder = self.http.get(url.clone());
        if let Some(accept) = &request.accept {
            builder = builder.header(ACCEPT, accept);
        }
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
