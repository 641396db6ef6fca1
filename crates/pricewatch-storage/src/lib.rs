//! Page fetching over HTTP and the row-addressable worksheet tables pricewatch persists to.

mod worksheet;

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub use worksheet::{FileWorksheet, MemoryWorksheet, StoreError, Workbook, Worksheet};

pub const CRATE_NAME: &str = "pricewatch-storage";

/// How often and how patiently a page GET is repeated after a transient failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Pause before retry number `retry + 1`, or `None` once retries are used up.
    /// Doubles from `base_delay` and never exceeds `max_delay`.
    pub fn pause_before(&self, retry: usize) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct PageClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for PageClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Whether another attempt at the same URL may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        }
    }
}

/// GETs product pages with a per-request timeout. Server errors, throttling and
/// connection-level failures are retried under the configured [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: PageClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building page client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_page_with_retries(url).instrument(span).await
    }

    async fn fetch_page_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut retry = 0;
        loop {
            let err = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.text().await?;
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => FetchError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: resp.url().to_string(),
                },
                Err(err) => FetchError::Request(err),
            };

            let pause = if err.is_transient() {
                self.retry.pause_before(retry)
            } else {
                None
            };
            let Some(pause) = pause else {
                return Err(err);
            };
            debug!(error = %err, retry, ?pause, "page fetch failed, retrying");
            tokio::time::sleep(pause).await;
            retry += 1;
        }
    }
}
