//! Core domain model for pricewatch: candidates, snapshots, tracked records and pass results.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-core";

static CANDIDATE_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("valid regex"));

/// One cell of the source list, classified before any fetch happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate<'a> {
    /// Blank cell.
    Empty,
    /// Non-empty text that is not an absolute http(s) URL, e.g. a heading or a note.
    Annotation(&'a str),
    Url(&'a str),
}

impl<'a> Candidate<'a> {
    pub fn classify(cell: &'a str) -> Self {
        if cell.is_empty() {
            Candidate::Empty
        } else if CANDIDATE_URL_RE.is_match(cell) {
            Candidate::Url(cell)
        } else {
            Candidate::Annotation(cell)
        }
    }
}

/// Product data observed by a single fetch. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub title: String,
    /// Site-assigned product code; the only reconciliation key.
    pub identifier: String,
    /// Numeric text without currency, compared verbatim.
    pub price: String,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

/// Fixed column layout of the tracked-product table (1-based, sheet style).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackedColumn {
    Identifier,
    Title,
    Price,
    Url,
}

impl TrackedColumn {
    pub const ALL: [TrackedColumn; 4] = [
        TrackedColumn::Identifier,
        TrackedColumn::Title,
        TrackedColumn::Price,
        TrackedColumn::Url,
    ];

    pub fn index(self) -> usize {
        match self {
            TrackedColumn::Identifier => 1,
            TrackedColumn::Title => 2,
            TrackedColumn::Price => 3,
            TrackedColumn::Url => 4,
        }
    }
}

/// A row of the tracked-product table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub row: usize,
    pub identifier: String,
    pub title: String,
    pub price: String,
    pub url: String,
}

impl TrackedRecord {
    /// Build a record from sheet cells; missing trailing cells read as empty.
    pub fn from_cells(row: usize, cells: &[String]) -> Self {
        let cell = |column: TrackedColumn| cells.get(column.index() - 1).cloned().unwrap_or_default();
        Self {
            row,
            identifier: cell(TrackedColumn::Identifier),
            title: cell(TrackedColumn::Title),
            price: cell(TrackedColumn::Price),
            url: cell(TrackedColumn::Url),
        }
    }

    /// Cell values for a brand new row, in column order.
    pub fn new_row(snapshot: &ProductSnapshot) -> Vec<String> {
        vec![
            snapshot.identifier.clone(),
            snapshot.title.clone(),
            snapshot.price.clone(),
            snapshot.source_url.clone(),
        ]
    }
}

/// A detected price change for a tracked product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceDelta {
    pub identifier: String,
    pub url: String,
    pub old_price: String,
    pub new_price: String,
}

impl PriceDelta {
    /// Compare a stored price with a fresh snapshot using exact string equality.
    ///
    /// No numeric normalization happens here: `"1200"` and `"1200.0"` are different prices.
    pub fn detect(stored_price: &str, snapshot: &ProductSnapshot) -> Option<Self> {
        if stored_price == snapshot.price {
            return None;
        }
        Some(Self {
            identifier: snapshot.identifier.clone(),
            url: snapshot.source_url.clone(),
            old_price: stored_price.to_string(),
            new_price: snapshot.price.clone(),
        })
    }
}

/// Aggregate counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassResult {
    /// Well-formed candidate URLs handed to the fetcher.
    pub processed: usize,
    pub updated: usize,
    pub inserted: usize,
    pub failures: usize,
    /// Delta messages the notifier rejected.
    pub notify_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: PassResult,
    pub outcome: PassOutcome,
}

impl PassReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, PassOutcome::Completed)
    }
}
