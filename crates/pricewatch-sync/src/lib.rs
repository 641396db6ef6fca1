//! Reconciliation passes: read the link list, fetch each product, diff against the
//! price table, write back and notify.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use pricewatch_adapters::{
    FieldWait, HtmlSnapshotFetcher, SelectorProfile, SnapshotError, SnapshotFetcher,
};
use pricewatch_core::{
    Candidate, PassOutcome, PassReport, PassResult, PriceDelta, ProductSnapshot, TrackedColumn,
    TrackedRecord,
};
use pricewatch_notify::{
    escape_html, LogNotifier, MessageOptions, Notifier, NotifyError, TelegramConfig,
    TelegramNotifier, DEFAULT_TELEGRAM_API_BASE,
};
use pricewatch_storage::{
    HttpFetcher, PageClientConfig, RetryPolicy, StoreError, Workbook, Worksheet,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-sync";

pub const DEFAULT_INTERVAL_SECS: u64 = 86_410;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workbook_dir: PathBuf,
    pub links_sheet: String,
    pub prices_sheet: String,
    pub links_column: usize,
    pub interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub field_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub selectors_path: Option<PathBuf>,
    pub currency_suffix: String,
    pub telegram: Option<TelegramConfig>,
    pub log_level: String,
    pub error_log: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let telegram = match (lookup("TELEGRAM_BOT_TOKEN"), lookup("TELEGRAM_CHAT_ID")) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some(TelegramConfig {
                    api_base: lookup("TELEGRAM_API_BASE")
                        .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
                    ..TelegramConfig::new(token, chat_id)
                })
            }
            _ => None,
        };

        Self {
            workbook_dir: lookup("PRICEWATCH_WORKBOOK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./workbook")),
            links_sheet: lookup("PRICEWATCH_LINKS_SHEET").unwrap_or_else(|| "links".to_string()),
            prices_sheet: lookup("PRICEWATCH_PRICES_SHEET")
                .unwrap_or_else(|| "prices".to_string()),
            links_column: (number("PRICEWATCH_LINKS_COLUMN", 1) as usize).max(1),
            interval_secs: number("PRICEWATCH_INTERVAL_SECS", DEFAULT_INTERVAL_SECS).max(1),
            fetch_timeout_secs: number("PRICEWATCH_FETCH_TIMEOUT_SECS", 150),
            field_timeout_secs: number("PRICEWATCH_FIELD_TIMEOUT_SECS", 40),
            poll_interval_ms: number("PRICEWATCH_POLL_INTERVAL_MS", 2_000),
            http_timeout_secs: number("PRICEWATCH_HTTP_TIMEOUT_SECS", 20),
            user_agent: lookup("PRICEWATCH_USER_AGENT")
                .unwrap_or_else(|| "pricewatch-bot/0.1".to_string()),
            selectors_path: lookup("PRICEWATCH_SELECTORS").map(PathBuf::from),
            currency_suffix: lookup("PRICEWATCH_CURRENCY_SUFFIX").unwrap_or_else(|| "р".to_string()),
            telegram,
            log_level: lookup("PRICEWATCH_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            error_log: lookup("PRICEWATCH_ERROR_LOG").map(PathBuf::from),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Errors that end a pass early. Per-URL fetch failures never do.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("completion notice not delivered: {0}")]
    CompletionNotice(#[source] NotifyError),
}

#[derive(Debug, Error)]
#[error("fetch failed for {url}: {cause}")]
pub struct FetchFailed {
    pub url: String,
    pub cause: FetchCause,
}

#[derive(Debug, Error)]
pub enum FetchCause {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("no snapshot within {0:?}")]
    TimedOut(Duration),
}

/// Tracked-product view over the prices worksheet, keyed by identifier.
#[derive(Clone)]
pub struct TrackedProductStore {
    sheet: Arc<dyn Worksheet>,
}

impl TrackedProductStore {
    pub fn new(sheet: Arc<dyn Worksheet>) -> Self {
        Self { sheet }
    }

    pub async fn find(&self, identifier: &str) -> Result<Option<TrackedRecord>, StoreError> {
        let Some(row) = self
            .sheet
            .find_in_column(TrackedColumn::Identifier.index(), identifier)
            .await?
        else {
            return Ok(None);
        };
        let cells = self.sheet.row_values(row).await?;
        Ok(Some(TrackedRecord::from_cells(row, &cells)))
    }

    /// Write a new row directly below the last filled identifier cell.
    pub async fn insert(&self, snapshot: &ProductSnapshot) -> Result<usize, StoreError> {
        let next_row = self
            .sheet
            .col_values(TrackedColumn::Identifier.index())
            .await?
            .len()
            + 1;
        self.sheet
            .write_row(next_row, &TrackedRecord::new_row(snapshot))
            .await?;
        Ok(next_row)
    }

    pub async fn update_price(&self, row: usize, price: &str) -> Result<(), StoreError> {
        self.sheet
            .update_cell(row, TrackedColumn::Price.index(), price)
            .await
    }

    /// Every row with a non-empty identifier.
    pub async fn records(&self) -> Result<Vec<TrackedRecord>, StoreError> {
        let rows = self.sheet.all_values().await?;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(idx, cells)| TrackedRecord::from_cells(idx + 1, cells))
            .filter(|record| !record.identifier.is_empty())
            .collect())
    }
}

/// Operator-facing message texts.
#[derive(Debug, Clone)]
pub struct MessageFormat {
    pub currency_suffix: String,
}

impl Default for MessageFormat {
    fn default() -> Self {
        Self {
            currency_suffix: "р".to_string(),
        }
    }
}

impl MessageFormat {
    pub const COMPLETION: &'static str = "Price check complete";
    pub const ABORTED: &'static str = "Price check aborted, see the error log";

    /// HTML message for a price change.
    pub fn price_delta(&self, delta: &PriceDelta) -> String {
        let suffix = escape_html(&self.currency_suffix);
        format!(
            "Price for <a href='{}'>{}</a> changed from {}{suffix} to {}{suffix}.",
            escape_html(&delta.url),
            escape_html(&delta.identifier),
            escape_html(&delta.old_price),
            escape_html(&delta.new_price),
        )
    }
}

pub struct ReconcileEngine {
    sources: Arc<dyn Worksheet>,
    source_column: usize,
    store: TrackedProductStore,
    fetcher: Arc<dyn SnapshotFetcher>,
    notifier: Arc<dyn Notifier>,
    messages: MessageFormat,
    fetch_timeout: Duration,
}

impl ReconcileEngine {
    pub fn new(
        sources: Arc<dyn Worksheet>,
        store: Arc<dyn Worksheet>,
        fetcher: Arc<dyn SnapshotFetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            sources,
            source_column: 1,
            store: TrackedProductStore::new(store),
            fetcher,
            notifier,
            messages: MessageFormat::default(),
            fetch_timeout: Duration::from_secs(150),
        }
    }

    pub fn with_source_column(mut self, column: usize) -> Self {
        self.source_column = column.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_messages(mut self, messages: MessageFormat) -> Self {
        self.messages = messages;
        self
    }

    pub fn store(&self) -> &TrackedProductStore {
        &self.store
    }

    /// Run one full pass. Never fails: a pass that cannot finish is reported as aborted.
    pub async fn run_pass(&self) -> PassReport {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pass", %pass_id);

        let mut result = PassResult::default();
        let outcome = match self.reconcile(&mut result).instrument(span.clone()).await {
            Ok(()) => PassOutcome::Completed,
            Err(err) => {
                error!(parent: &span, error = %err, "pass aborted");
                if matches!(err, PassError::StoreUnavailable(_)) {
                    if let Err(notify_err) = self
                        .notifier
                        .send_message(MessageFormat::ABORTED, MessageOptions::plain())
                        .await
                    {
                        error!(parent: &span, error = %notify_err, "abort notice not delivered");
                    }
                }
                PassOutcome::Aborted {
                    reason: err.to_string(),
                }
            }
        };

        let finished_at = Utc::now();
        info!(
            parent: &span,
            processed = result.processed,
            updated = result.updated,
            inserted = result.inserted,
            failures = result.failures,
            notify_failures = result.notify_failures,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "pass finished"
        );

        PassReport {
            pass_id,
            started_at,
            finished_at,
            result,
            outcome,
        }
    }

    async fn reconcile(&self, result: &mut PassResult) -> Result<(), PassError> {
        let cells = self.sources.col_values(self.source_column).await?;
        info!(
            sheet = self.sources.title(),
            cells = cells.len(),
            "source list loaded"
        );

        for cell in &cells {
            let url = match Candidate::classify(cell) {
                Candidate::Empty => continue,
                Candidate::Annotation(text) => {
                    debug!(cell = text, "skipping non-url cell");
                    continue;
                }
                Candidate::Url(url) => url,
            };

            result.processed += 1;
            match self.fetch_bounded(url).await {
                Ok(snapshot) => self.apply(&snapshot, result).await?,
                Err(err) => {
                    error!(url = %err.url, cause = %err.cause, "fetch failed");
                    result.failures += 1;
                }
            }
        }

        self.notifier
            .send_message(MessageFormat::COMPLETION, MessageOptions::plain())
            .await
            .map_err(PassError::CompletionNotice)?;
        Ok(())
    }

    async fn fetch_bounded(&self, url: &str) -> Result<ProductSnapshot, FetchFailed> {
        let cause = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(url)).await {
            Ok(Ok(snapshot)) => return Ok(snapshot),
            Ok(Err(err)) => FetchCause::Snapshot(err),
            Err(_) => FetchCause::TimedOut(self.fetch_timeout),
        };
        Err(FetchFailed {
            url: url.to_string(),
            cause,
        })
    }

    async fn apply(&self, snapshot: &ProductSnapshot, result: &mut PassResult) -> Result<(), PassError> {
        let Some(record) = self.store.find(&snapshot.identifier).await? else {
            let row = self.store.insert(snapshot).await?;
            result.inserted += 1;
            info!(identifier = %snapshot.identifier, row, price = %snapshot.price, "new product tracked");
            return Ok(());
        };

        let Some(delta) = PriceDelta::detect(&record.price, snapshot) else {
            debug!(identifier = %snapshot.identifier, price = %snapshot.price, "price unchanged");
            return Ok(());
        };

        self.store.update_price(record.row, &delta.new_price).await?;
        result.updated += 1;
        info!(
            identifier = %delta.identifier,
            row = record.row,
            old_price = %delta.old_price,
            new_price = %delta.new_price,
            "price changed"
        );

        if let Err(err) = self
            .notifier
            .send_message(&self.messages.price_delta(&delta), MessageOptions::rich())
            .await
        {
            warn!(identifier = %delta.identifier, error = %err, "price change notice not delivered");
            result.notify_failures += 1;
        }
        Ok(())
    }
}

/// Wire the file workbook, HTTP fetcher and configured notifier into an engine.
pub fn build_engine(config: &SyncConfig) -> Result<ReconcileEngine> {
    let workbook = Workbook::open(&config.workbook_dir);
    let sources: Arc<dyn Worksheet> = Arc::new(workbook.existing_worksheet(&config.links_sheet));

    let engine = ReconcileEngine::new(
        sources,
        prices_sheet(config),
        Arc::new(build_fetcher(config)?),
        build_notifier(config)?,
    )
    .with_source_column(config.links_column)
    .with_fetch_timeout(Duration::from_secs(config.fetch_timeout_secs))
    .with_messages(MessageFormat {
        currency_suffix: config.currency_suffix.clone(),
    });
    Ok(engine)
}

fn prices_sheet(config: &SyncConfig) -> Arc<dyn Worksheet> {
    Arc::new(Workbook::open(&config.workbook_dir).worksheet(&config.prices_sheet))
}

pub fn open_store(config: &SyncConfig) -> TrackedProductStore {
    TrackedProductStore::new(prices_sheet(config))
}

pub fn build_fetcher(config: &SyncConfig) -> Result<HtmlSnapshotFetcher> {
    let http = HttpFetcher::new(PageClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        retry: RetryPolicy::default(),
    })?;
    let selectors = match &config.selectors_path {
        Some(path) => SelectorProfile::from_yaml_file(path)?,
        None => SelectorProfile::default(),
    };
    let wait = FieldWait {
        field_timeout: Duration::from_secs(config.field_timeout_secs),
        poll_interval: Duration::from_millis(config.poll_interval_ms),
    };
    HtmlSnapshotFetcher::new(http, selectors, wait).context("building snapshot fetcher")
}

pub fn build_notifier(config: &SyncConfig) -> Result<Arc<dyn Notifier>> {
    match &config.telegram {
        Some(telegram) => Ok(Arc::new(TelegramNotifier::new(telegram.clone())?)),
        None => {
            warn!("TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID not set; notifications go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}

pub async fn run_pass_once_from_env() -> Result<PassReport> {
    let config = SyncConfig::from_env();
    let engine = build_engine(&config)?;
    Ok(engine.run_pass().await)
}

/// Serializes passes: a trigger that arrives while a pass is running is dropped.
#[derive(Clone)]
pub struct PassRunner {
    engine: Arc<ReconcileEngine>,
    running: Arc<Mutex<()>>,
}

impl PassRunner {
    pub fn new(engine: ReconcileEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            running: Arc::new(Mutex::new(())),
        }
    }

    pub async fn trigger(&self) -> Option<PassReport> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("pass already running; trigger skipped");
            return None;
        };
        Some(self.engine.run_pass().await)
    }
}

/// Start a scheduler that triggers a pass every `interval`.
pub async fn build_scheduler(runner: PassRunner, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            info!("scheduler: starting price check");
            runner.trigger().await;
        })
    })
    .with_context(|| format!("creating scheduler job every {interval:?}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    Ok(sched)
}

/// Run a pass now, then one every configured interval until ctrl-c.
pub async fn watch_until_ctrl_c(config: &SyncConfig) -> Result<()> {
    let runner = PassRunner::new(build_engine(config)?);
    runner.trigger().await;

    let mut sched = build_scheduler(runner, config.interval()).await?;
    info!(interval_secs = config.interval_secs, "scheduler running");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> SyncConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn config_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.interval_secs, 86_410);
        assert_eq!(config.field_timeout_secs, 40);
        assert_eq!(config.links_sheet, "links");
        assert_eq!(config.prices_sheet, "prices");
        assert_eq!(config.links_column, 1);
        assert!(config.telegram.is_none());
        assert!(config.selectors_path.is_none());
    }

    #[test]
    fn config_overrides_and_bad_numbers() {
        let config = config_from(&[
            ("PRICEWATCH_INTERVAL_SECS", "3600"),
            ("PRICEWATCH_FIELD_TIMEOUT_SECS", "soon"),
            ("PRICEWATCH_LINKS_COLUMN", "0"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "42"),
        ]);
        assert_eq!(config.interval(), Duration::from_secs(3600));
        assert_eq!(config.field_timeout_secs, 40);
        assert_eq!(config.links_column, 1);
        let telegram = config.telegram.expect("telegram configured");
        assert_eq!(telegram.chat_id, "42");
        assert_eq!(telegram.api_base, DEFAULT_TELEGRAM_API_BASE);
    }

    #[test]
    fn telegram_needs_both_token_and_chat() {
        let config = config_from(&[("TELEGRAM_BOT_TOKEN", "123:abc")]);
        assert!(config.telegram.is_none());
    }

    #[test]
    fn price_delta_message_links_identifier_to_url() {
        let messages = MessageFormat::default();
        let text = messages.price_delta(&PriceDelta {
            identifier: "A1".into(),
            url: "https://example.com/p1?a=1&b=2".into(),
            old_price: "100".into(),
            new_price: "90".into(),
        });
        assert_eq!(
            text,
            "Price for <a href='https://example.com/p1?a=1&amp;b=2'>A1</a> changed from 100р to 90р."
        );
    }
}
