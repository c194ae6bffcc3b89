//! Persistent catalog/sales store.
//!
//! The sync jobs only see [`CatalogStore`]; production wires in
//! [`postgres::PgCatalogStore`], tests and dry runs use [`memory::MemoryStore`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{CatalogItem, Category, ItemPatch, NewCatalogItem, SaleRecord};

pub use memory::MemoryStore;
pub use postgres::PgCatalogStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("write rejected for {key}: {reason}")]
    WriteRejected { key: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Row selection for catalog reads. Results are always ordered by id so that
/// offset-based batches are stable across invocations.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub category: Option<Category>,
    /// Case-insensitive exact theme name.
    pub theme: Option<String>,
    pub with_set_number: bool,
    pub ids: Option<Vec<i64>>,
}

impl ItemFilter {
    pub fn with_set_numbers() -> Self {
        Self {
            with_set_number: true,
            ..Default::default()
        }
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    pub fn matches(&self, item: &CatalogItem) -> bool {
        if self.with_set_number
            && item
                .set_number
                .as_deref()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true)
        {
            return false;
        }
        if let Some(category) = self.category {
            if item.category != category {
                return false;
            }
        }
        if let Some(theme) = self.theme.as_deref() {
            match item.theme.as_deref() {
                Some(t) if t.eq_ignore_ascii_case(theme) => {}
                _ => return false,
            }
        }
        if let Some(ids) = self.ids.as_ref() {
            if !ids.contains(&item.id) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn count_items(&self, filter: &ItemFilter) -> Result<u64, StoreError>;

    async fn list_items(
        &self,
        filter: &ItemFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogItem>, StoreError>;

    /// Insert or update by (set_number, category). Existing non-null columns
    /// are never overwritten by the incoming row.
    async fn upsert_item(&self, item: &NewCatalogItem) -> Result<UpsertOutcome, StoreError>;

    async fn apply_patch(&self, item_id: i64, patch: &ItemPatch) -> Result<(), StoreError>;

    async fn insert_sales(&self, sales: &[SaleRecord]) -> Result<u64, StoreError>;

    async fn sales_since(
        &self,
        item_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<SaleRecord>, StoreError>;

    async fn set_derived_prices(
        &self,
        item_id: i64,
        avg_sale_price: Option<f64>,
        new_avg_price: Option<f64>,
    ) -> Result<(), StoreError>;
}
