//! Snapshot fetcher contract + the CSS-selector product page fetcher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use pricewatch_core::ProductSnapshot;
use pricewatch_storage::{FetchError, FetchedPage, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

pub const CRATE_NAME: &str = "pricewatch-adapters";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("{field} not found with selector `{selector}` after {waited:?}")]
    MissingField {
        field: &'static str,
        selector: String,
        waited: Duration,
    },
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("page session pool closed")]
    SessionClosed,
}

/// Produces a product snapshot for a URL, or the reason it could not.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ProductSnapshot, SnapshotError>;
}

/// CSS selectors locating the three required fields on a product page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorProfile {
    pub title: String,
    pub identifier: String,
    pub price: String,
}

impl Default for SelectorProfile {
    fn default() -> Self {
        Self {
            title: "h1.product-page__title".to_string(),
            identifier: "span#productNmId".to_string(),
            price: "ins.price-block__final-price.wallet".to_string(),
        }
    }
}

impl SelectorProfile {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        for selector in [&self.title, &self.identifier, &self.price] {
            parse_selector(selector)?;
        }
        Ok(())
    }
}

/// How long to keep re-reading a page while a required field is absent.
#[derive(Debug, Clone, Copy)]
pub struct FieldWait {
    pub field_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for FieldWait {
    fn default() -> Self {
        Self {
            field_timeout: Duration::from_secs(40),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Pool of page sessions; one session is one live page load at a time.
#[derive(Debug, Clone)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
}

impl SessionPool {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_sessions.max(1))),
        }
    }

    pub async fn open(&self, url: &str) -> Result<PageSession, SnapshotError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SnapshotError::SessionClosed)?;
        debug!(url, "page session opened");
        Ok(PageSession {
            _permit: permit,
            url: url.to_string(),
            opened_at: Instant::now(),
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Scoped hold on a page session. Released when dropped, whatever the exit path.
#[derive(Debug)]
pub struct PageSession {
    _permit: OwnedSemaphorePermit,
    url: String,
    opened_at: Instant,
}

impl Drop for PageSession {
    fn drop(&mut self) {
        debug!(
            url = %self.url,
            held_ms = self.opened_at.elapsed().as_millis() as u64,
            "page session released"
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum ProductField {
    Title,
    Identifier,
    Price,
}

impl ProductField {
    fn name(self) -> &'static str {
        match self {
            ProductField::Title => "title",
            ProductField::Identifier => "identifier",
            ProductField::Price => "price",
        }
    }

    fn selector(self, profile: &SelectorProfile) -> &str {
        match self {
            ProductField::Title => &profile.title,
            ProductField::Identifier => &profile.identifier,
            ProductField::Price => &profile.price,
        }
    }
}

/// Loads product pages over HTTP and reads title, identifier and price by CSS selector.
#[derive(Debug, Clone)]
pub struct HtmlSnapshotFetcher {
    http: HttpFetcher,
    selectors: SelectorProfile,
    wait: FieldWait,
    sessions: SessionPool,
}

impl HtmlSnapshotFetcher {
    pub fn new(
        http: HttpFetcher,
        selectors: SelectorProfile,
        wait: FieldWait,
    ) -> Result<Self, SnapshotError> {
        selectors.validate()?;
        Ok(Self {
            http,
            selectors,
            wait,
            sessions: SessionPool::new(1),
        })
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Read `field` from the current page, reloading it until the field shows up
    /// or the per-field timeout runs out.
    async fn wait_for_field(
        &self,
        url: &str,
        page: &mut FetchedPage,
        field: ProductField,
    ) -> Result<String, SnapshotError> {
        let selector = field.selector(&self.selectors);
        let started = Instant::now();
        let deadline = started + self.wait.field_timeout;
        loop {
            if let Some(text) = select_first_text(&page.body, selector)? {
                return Ok(text);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SnapshotError::MissingField {
                    field: field.name(),
                    selector: selector.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.wait.poll_interval.min(deadline - now)).await;
            *page = self.http.fetch_page(url).await?;
        }
    }
}

#[async_trait]
impl SnapshotFetcher for HtmlSnapshotFetcher {
    async fn fetch(&self, url: &str) -> Result<ProductSnapshot, SnapshotError> {
        let _session = self.sessions.open(url).await?;

        let mut page = self.http.fetch_page(url).await?;
        let title = self.wait_for_field(url, &mut page, ProductField::Title).await?;
        let identifier = self
            .wait_for_field(url, &mut page, ProductField::Identifier)
            .await?;
        let price_text = self.wait_for_field(url, &mut page, ProductField::Price).await?;
        let price = price_token(&price_text).ok_or_else(|| {
            SnapshotError::Message(format!("price text `{price_text}` has no price token"))
        })?;

        Ok(ProductSnapshot {
            title,
            identifier,
            price,
            source_url: url.to_string(),
            fetched_at: Utc::now(),
        })
    }
}

/// The leading whitespace-separated token of a price label, e.g. `"1 299 ₽"` → `"1"`
/// and `"1299 ₽"` → `"1299"`.
pub fn price_token(text: &str) -> Option<String> {
    text.split_whitespace().next().map(str::to_string)
}

fn parse_selector(selector: &str) -> Result<Selector, SnapshotError> {
    Selector::parse(selector).map_err(|e| SnapshotError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(body: &str, selector: &str) -> Result<Option<String>, SnapshotError> {
    let sel = parse_selector(selector)?;
    let document = Html::parse_document(body);
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}
