use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

use super::{CatalogStore, ItemFilter, StoreError, UpsertOutcome};
use crate::model::{CatalogItem, ItemPatch, NewCatalogItem, SaleRecord};
use crate::reconcile::normalize::normalize_set_number;

#[derive(Default)]
struct Inner {
    items: Vec<CatalogItem>,
    sales: Vec<SaleRecord>,
    next_id: i64,
    failing_items: HashSet<i64>,
    offline: bool,
}

/// In-process store with the same merge semantics as the Postgres store.
/// Write failures can be injected per item to exercise partial batches.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<CatalogItem>) -> Self {
        let next_id = items.iter().map(|i| i.id).max().unwrap_or(0);
        Self {
            inner: Mutex::new(Inner {
                items,
                next_id,
                ..Default::default()
            }),
        }
    }

    /// Every write touching `item_id` fails from now on.
    pub fn fail_writes_for(&self, item_id: i64) {
        self.lock().failing_items.insert(item_id);
    }

    /// Every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn items(&self) -> Vec<CatalogItem> {
        self.lock().items.clone()
    }

    pub fn item(&self, id: i64) -> Option<CatalogItem> {
        self.lock().items.iter().find(|i| i.id == id).cloned()
    }

    pub fn sales(&self) -> Vec<SaleRecord> {
        self.lock().sales.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.offline {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(inner)
    }
}

fn same_key(item: &CatalogItem, incoming: &NewCatalogItem) -> bool {
    item.category == incoming.category
        && item.set_number.as_deref().and_then(normalize_set_number)
            == normalize_set_number(&incoming.set_number)
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.guard().map(|_| ())
    }

    async fn count_items(&self, filter: &ItemFilter) -> Result<u64, StoreError> {
        let inner = self.guard()?;
        Ok(inner.items.iter().filter(|i| filter.matches(i)).count() as u64)
    }

    async fn list_items(
        &self,
        filter: &ItemFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogItem>, StoreError> {
        let inner = self.guard()?;
        let mut rows: Vec<CatalogItem> = inner
            .items
            .iter()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.id);
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn upsert_item(&self, item: &NewCatalogItem) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.guard()?;
        if let Some(pos) = inner.items.iter().position(|i| same_key(i, item)) {
            let id = inner.items[pos].id;
            if inner.failing_items.contains(&id) {
                return Err(StoreError::WriteRejected {
                    key: item.set_number.clone(),
                    reason: "injected failure".into(),
                });
            }
            let existing = &mut inner.items[pos];
            existing.name = item.name.clone();
            if existing.theme.is_none() {
                existing.theme = item.theme.clone();
            }
            if existing.year_released.is_none() {
                existing.year_released = item.year_released;
            }
            if existing.piece_count.unwrap_or(0) == 0 {
                existing.piece_count = item.piece_count.or(existing.piece_count);
            }
            if existing.image_url.is_none() {
                existing.image_url = item.image_url.clone();
            }
            return Ok(UpsertOutcome::Updated(id));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let mut row = CatalogItem::new(id, Some(&item.set_number), &item.name, item.category);
        row.theme = item.theme.clone();
        row.year_released = item.year_released;
        row.piece_count = item.piece_count;
        row.image_url = item.image_url.clone();
        inner.items.push(row);
        Ok(UpsertOutcome::Inserted(id))
    }

    async fn apply_patch(&self, item_id: i64, patch: &ItemPatch) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        if inner.failing_items.contains(&item_id) {
            return Err(StoreError::WriteRejected {
                key: item_id.to_string(),
                reason: "injected failure".into(),
            });
        }
        let row = inner
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| StoreError::Query(format!("no catalog item {item_id}")))?;
        if let Some(v) = patch.retail_price {
            row.retail_price = Some(v);
        }
        if let Some(v) = patch.piece_count {
            row.piece_count = Some(v);
        }
        if let Some(v) = patch.image_url.as_ref() {
            row.image_url = Some(v.clone());
        }
        if let Some(v) = patch.is_retired {
            row.is_retired = v;
        }
        if let Some(v) = patch.year_retired {
            row.year_retired = Some(v);
        }
        Ok(())
    }

    async fn insert_sales(&self, sales: &[SaleRecord]) -> Result<u64, StoreError> {
        let mut inner = self.guard()?;
        let failing = &inner.failing_items;
        if let Some(bad) = sales.iter().find(|s| failing.contains(&s.item_id)) {
            return Err(StoreError::WriteRejected {
                key: bad.item_id.to_string(),
                reason: "injected failure".into(),
            });
        }
        inner.sales.extend(sales.iter().cloned());
        Ok(sales.len() as u64)
    }

    async fn sales_since(
        &self,
        item_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<SaleRecord>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .sales
            .iter()
            .filter(|s| s.item_id == item_id && s.sale_date > since)
            .cloned()
            .collect())
    }

    async fn set_derived_prices(
        &self,
        item_id: i64,
        avg_sale_price: Option<f64>,
        new_avg_price: Option<f64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        if inner.failing_items.contains(&item_id) {
            return Err(StoreError::WriteRejected {
                key: item_id.to_string(),
                reason: "injected failure".into(),
            });
        }
        let row = inner
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| StoreError::Query(format!("no catalog item {item_id}")))?;
        row.avg_sale_price = avg_sale_price;
        row.new_avg_price = new_avg_price;
        Ok(())
    }
}
