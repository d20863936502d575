//! Shared HTTP transport for the metadata service and the event feed.
//!
//! Every request passes a global in-flight limit, a per-service limit and an
//! optional request-rate limiter, then retries transient failures with capped
//! exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// 5xx and 429 are worth another attempt; every other status is final.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRate {
    pub burst: u32,
    pub interval: Duration,
}

impl RequestRate {
    /// `per_minute` requests per minute, spread evenly, with a burst of the same size.
    pub fn per_minute(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            burst: per_minute,
            interval: Duration::from_millis(60_000 / u64::from(per_minute)),
        }
    }
}

#[derive(Debug)]
struct Permits {
    available: u32,
    refilled_at: Instant,
}

/// Token bucket: one permit regained every `interval`, never more than `burst`.
#[derive(Debug)]
pub struct RateLimiter {
    rate: RequestRate,
    permits: Mutex<Permits>,
}

impl RateLimiter {
    pub fn new(rate: RequestRate) -> Self {
        Self {
            rate,
            permits: Mutex::new(Permits {
                available: rate.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wake_at = {
                let mut permits = self.permits.lock().await;
                if !self.rate.interval.is_zero() {
                    let regained = permits.refilled_at.elapsed().as_nanos()
                        / self.rate.interval.as_nanos();
                    if regained > 0 {
                        let regained = u32::try_from(regained).unwrap_or(u32::MAX);
                        permits.available = permits.available.saturating_add(regained).min(self.rate.burst);
                        permits.refilled_at += self.rate.interval * regained.min(self.rate.burst);
                    }
                }
                if permits.available > 0 {
                    permits.available -= 1;
                    return;
                }
                permits.refilled_at + self.rate.interval
            };
            tokio::time::sleep_until(wake_at).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_service: usize,
    pub retry: RetryPolicy,
    pub rate: Option<RequestRate>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_service: 4,
            retry: RetryPolicy::default(),
            rate: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("undecodable response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Request { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

enum AttemptError {
    Transient(TransportError),
    Final(TransportError),
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_service_limit: usize,
    per_service: Mutex<HashMap<String, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_service_limit: config.max_in_flight_per_service.max(1),
            per_service: Mutex::new(HashMap::new()),
            limiter: config.rate.map(RateLimiter::new),
            retry: config.retry,
        })
    }

    async fn service_gate(&self, service: &str) -> Arc<Semaphore> {
        self.per_service
            .lock()
            .await
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_service_limit)))
            .clone()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        service: &str,
        url: &str,
    ) -> Result<T, TransportError> {
        let response = self.send::<()>(service, Method::GET, url, None).await?;
        serde_json::from_slice(&response.body).map_err(|source| TransportError::Decode {
            url: response.url,
            source,
        })
    }

    pub async fn put_json<B: Serialize + ?Sized>(
        &self,
        service: &str,
        url: &str,
        body: &B,
    ) -> Result<TransportResponse, TransportError> {
        self.send(service, Method::PUT, url, Some(body)).await
    }

    pub async fn send<B: Serialize + ?Sized>(
        &self,
        service: &str,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<TransportResponse, TransportError> {
        let _slot = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| TransportError::LimiterClosed)?;
        let gate = self.service_gate(service).await;
        let _service_slot = gate.acquire().await.map_err(|_| TransportError::LimiterClosed)?;
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let span = info_span!("http_request", service, %method, url);
        async {
            let mut retry = 0u32;
            loop {
                match self.attempt(&method, url, body).await {
                    Ok(response) => return Ok(response),
                    Err(AttemptError::Transient(err)) if retry < self.retry.max_retries => {
                        let delay = self.retry.delay_before_retry(retry);
                        debug!(error = %err, retry, ?delay, "transient failure; retrying");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    Err(AttemptError::Transient(err) | AttemptError::Final(err)) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<TransportResponse, AttemptError> {
        self.dispatch(method, url, body).await.map_err(|err| {
            let transient = match &err {
                TransportError::Status { status, .. } => {
                    StatusCode::from_u16(*status).is_ok_and(is_retryable_status)
                }
                TransportError::Request { source, .. } => is_retryable_transport(source),
                _ => false,
            };
            if transient {
                AttemptError::Transient(err)
            } else {
                AttemptError::Final(err)
            }
        })
    }

    async fn dispatch<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let request_error = |source| TransportError::Request {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: final_url,
                body,
            });
        }
        let body = response.bytes().await.map_err(request_error)?;
        Ok(TransportResponse {
            status,
            url: final_url,
            body: body.to_vec(),
        })
    }
}
