//! Third-party data providers behind one paging capability.
//!
//! Each provider parses its own payload into one [`RawExternalRecord`]
//! variant; nothing downstream of this module knows a wire format.
//! Failures are scoped to a single unit of work and are recoverable unless
//! the provider is not configured at all.

pub mod brickset;
pub mod ebay;
pub mod http;
pub mod rebrickable;
pub mod wiki;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::model::{Category, ImageKind};

pub use brickset::BricksetAdapter;
pub use ebay::EbayAdapter;
pub use rebrickable::{CatalogKind, RebrickableAdapter};
pub use wiki::WikiImageAdapter;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{provider} returned HTTP {status} for {unit}: {body}")]
    Status {
        provider: &'static str,
        unit: String,
        status: u16,
        body: String,
    },
    #[error("{provider} request for {unit} timed out")]
    Timeout { provider: &'static str, unit: String },
    #[error("{provider} request for {unit} failed: {message}")]
    Transport {
        provider: &'static str,
        unit: String,
        message: String,
    },
    #[error("{provider} returned a malformed body for {unit}: {message}")]
    Malformed {
        provider: &'static str,
        unit: String,
        message: String,
    },
    #[error("{provider} is not configured: missing {missing}")]
    NotConfigured {
        provider: &'static str,
        missing: &'static str,
    },
}

impl SourceError {
    /// Recoverable errors skip the current unit; the rest abort the batch.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SourceError::NotConfigured { .. })
    }

    pub fn provider(&self) -> &'static str {
        match self {
            SourceError::Status { provider, .. }
            | SourceError::Timeout { provider, .. }
            | SourceError::Transport { provider, .. }
            | SourceError::Malformed { provider, .. }
            | SourceError::NotConfigured { provider, .. } => provider,
        }
    }
}

/// What one adapter call is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOfWork {
    Set { set_number: String, category: Category },
    Theme { name: String, provider_id: Option<i64> },
}

impl fmt::Display for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOfWork::Set { set_number, category } => write!(f, "set {category}:{set_number}"),
            UnitOfWork::Theme { name, .. } => write!(f, "theme {name}"),
        }
    }
}

/// Position inside a provider's result set. Adapters are not restartable
/// mid-page; callers keep the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Start,
    Page(u32),
    Url(String),
    Token(String),
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next: Option<Cursor>,
    /// Total result count when the provider reports one.
    pub total: Option<u64>,
}

impl<T> Page<T> {
    pub fn last(records: Vec<T>, total: Option<u64>) -> Self {
        Self {
            records,
            next: None,
            total,
        }
    }
}

/// Completed auction listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub listing_id: String,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub sold_at: Option<DateTime<Utc>>,
    pub condition_hint: Option<String>,
}

/// Set or minifig row from the parts catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntryRecord {
    pub set_num: String,
    pub name: String,
    pub year: Option<i32>,
    pub num_parts: Option<i32>,
    pub theme_id: Option<i64>,
    pub image_url: Option<String>,
}

/// Set detail row from the set-catalog API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetDetailsRecord {
    pub number: String,
    pub name: String,
    pub theme: Option<String>,
    pub year: Option<i32>,
    pub pieces: Option<i32>,
    pub retail_price_us: Option<f64>,
    pub retired: Option<bool>,
    pub available_now: Option<bool>,
    pub last_available: Option<NaiveDate>,
    pub image_url: Option<String>,
    pub image_kind: Option<ImageKind>,
}

/// Image file found on the theme wiki.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeImageRecord {
    pub file_name: String,
    pub url: String,
    pub set_code: Option<String>,
    pub kind: ImageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawExternalRecord {
    Listing(ListingRecord),
    CatalogEntry(CatalogEntryRecord),
    SetDetails(SetDetailsRecord),
    ThemeImage(ThemeImageRecord),
}

/// Theme row as the parts catalog names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTheme {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Fixed pause between paginated requests.
    fn page_delay(&self) -> Duration;

    async fn fetch_page(
        &self,
        unit: &UnitOfWork,
        cursor: &Cursor,
    ) -> Result<Page<RawExternalRecord>, SourceError>;
}

/// Provider-side theme list, used to turn a configured theme name into the
/// provider's theme ids.
#[async_trait]
pub trait ThemeDirectory: Send + Sync {
    async fn themes(&self) -> Result<Vec<ProviderTheme>, SourceError>;
}

/// Follow `next` cursors until exhausted or `max_pages` were read, pausing
/// `page_delay` between requests. The returned page's `next` is the cursor
/// that was not followed, if the cap stopped the walk.
pub async fn fetch_all(
    adapter: &dyn SourceAdapter,
    unit: &UnitOfWork,
    max_pages: u32,
) -> Result<Page<RawExternalRecord>, SourceError> {
    let mut records = Vec::new();
    let mut total = None;
    let mut cursor = Cursor::Start;
    let mut pages = 0u32;
    loop {
        let page = adapter.fetch_page(unit, &cursor).await?;
        pages += 1;
        if total.is_none() {
            total = page.total;
        }
        records.extend(page.records);
        debug!(
            provider = adapter.provider(),
            unit = %unit,
            pages,
            records = records.len(),
            "fetched page"
        );
        match page.next {
            Some(next) if pages < max_pages.max(1) => {
                cursor = next;
                tokio::time::sleep(adapter.page_delay()).await;
            }
            next => {
                return Ok(Page {
                    records,
                    next,
                    total,
                })
            }
        }
    }
}
