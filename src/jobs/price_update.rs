//! Sold-listing price batch: one slice of the numbered catalog per call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{is_fatal_store_error, JobContext, JobError};
use crate::aggregate::recompute_item;
use crate::model::{CatalogItem, SaleRecord};
use crate::reconcile::{classify_listing, dedupe_listings, ListingVerdict};
use crate::sources::{fetch_all, RawExternalRecord, UnitOfWork};
use crate::store::ItemFilter;

pub const DEFAULT_BATCH_SIZE: u32 = 10;
pub const MAX_BATCH_SIZE: u32 = 50;
/// Listing pages read per set (100 entries each).
pub const LISTING_PAGE_CAP: u32 = 2;

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBatchRequest {
    #[serde(default)]
    pub batch: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Items of this batch already handled by an earlier partial call.
    #[serde(default)]
    pub skip: u32,
}

impl PriceBatchRequest {
    pub fn new(batch: u32, batch_size: u32) -> Self {
        Self {
            batch,
            batch_size,
            skip: 0,
        }
    }
}

impl Default for PriceBatchRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_BATCH_SIZE)
    }
}

/// One line of the per-batch log panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLogEntry {
    pub set: String,
    pub set_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ebay_total: Option<u64>,
}

impl BatchLogEntry {
    fn for_item(item: &CatalogItem, set_number: &str) -> Self {
        Self {
            set: item.name.clone(),
            set_number: set_number.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBatchReport {
    pub prices_saved: u64,
    pub sets_updated: u64,
    pub total_sets_with_numbers: Option<u64>,
    pub is_last_batch: bool,
    /// The time budget ran out before the batch was finished; call again
    /// with `skip = processedThrough` for the same batch.
    pub partial: bool,
    /// Items of this batch handled so far, counting `skip`.
    pub processed_through: u32,
    pub log: Vec<BatchLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PriceBatchOutcome {
    Done { done: bool },
    Progress(PriceBatchReport),
}

impl PriceBatchOutcome {
    pub fn done() -> Self {
        PriceBatchOutcome::Done { done: true }
    }
}

/// Process batch `req.batch` of the items that carry a set number, ordered
/// by id, starting `req.skip` items in. Per-set provider and write failures
/// are logged and skipped; an unreachable store or an unconfigured provider
/// fails the whole call. When the time budget runs out the call returns a
/// `partial` report; at least one item is handled per call.
#[instrument(skip(ctx), fields(batch = req.batch, batch_size = req.batch_size, skip = req.skip))]
pub async fn run_price_batch(
    ctx: &JobContext,
    req: PriceBatchRequest,
    now: DateTime<Utc>,
) -> Result<PriceBatchOutcome, JobError> {
    if req.batch_size == 0 || req.batch_size > MAX_BATCH_SIZE {
        return Err(JobError::InvalidRequest(format!(
            "batchSize must be between 1 and {MAX_BATCH_SIZE}"
        )));
    }
    if req.skip >= req.batch_size {
        return Err(JobError::InvalidRequest(
            "skip must be smaller than batchSize".into(),
        ));
    }
    let deadline = ctx.deadline();
    let filter = ItemFilter::with_set_numbers();
    let total = ctx.store.count_items(&filter).await?;
    let batch_start = u64::from(req.batch) * u64::from(req.batch_size);
    let offset = batch_start + u64::from(req.skip);
    if offset >= total {
        info!(total, offset, "no items left; batch run is done");
        return Ok(PriceBatchOutcome::done());
    }
    let items = ctx
        .store
        .list_items(&filter, offset, u64::from(req.batch_size - req.skip))
        .await?;
    if items.is_empty() {
        return Ok(PriceBatchOutcome::done());
    }

    let mut report = PriceBatchReport {
        total_sets_with_numbers: Some(total),
        processed_through: req.skip,
        ..Default::default()
    };

    for item in &items {
        let Some(set_number) = item.set_number.as_deref().map(str::trim) else {
            report.processed_through += 1;
            continue;
        };
        let mut entry = BatchLogEntry::for_item(item, set_number);
        if report.partial || (report.processed_through > req.skip && deadline.expired()) {
            report.partial = true;
            entry.error = Some("time budget exhausted; not processed".into());
            report.log.push(entry);
            continue;
        }
        report.processed_through += 1;

        let unit = UnitOfWork::Set {
            set_number: set_number.to_string(),
            category: item.category,
        };
        let page = match fetch_all(ctx.listings.as_ref(), &unit, LISTING_PAGE_CAP).await {
            Ok(page) => page,
            Err(e) if e.is_recoverable() => {
                warn!(set_number, provider = e.provider(), error = %e, "listing search failed; skipping set");
                entry.error = Some(e.to_string());
                report.log.push(entry);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        entry.ebay_total = page.total;

        let listings = dedupe_listings(
            page.records
                .into_iter()
                .filter_map(|r| match r {
                    RawExternalRecord::Listing(l) => Some(l),
                    _ => None,
                })
                .filter(|l| l.currency.eq_ignore_ascii_case("USD"))
                .collect(),
        );
        let sales: Vec<SaleRecord> = listings
            .into_iter()
            .filter_map(|l| {
                // Without an end time the sale cannot be placed in the window.
                let sold_at = l.sold_at?;
                match classify_listing(&l, set_number) {
                    ListingVerdict::Accept(condition) => Some(SaleRecord {
                        item_id: item.id,
                        sale_price: l.price,
                        sale_date: sold_at,
                        condition,
                        listing_title: l.title,
                    }),
                    ListingVerdict::Reject(_) => None,
                }
            })
            .collect();
        entry.matched = Some(sales.len() as u64);

        if !sales.is_empty() {
            match ctx.store.insert_sales(&sales).await {
                Ok(saved) => report.prices_saved += saved,
                Err(e) if is_fatal_store_error(&e) => return Err(e.into()),
                Err(e) => {
                    warn!(set_number, error = %e, "saving sales failed; skipping set");
                    entry.error = Some(e.to_string());
                    report.log.push(entry);
                    continue;
                }
            }
            match recompute_item(ctx.store.as_ref(), item.id, now, &ctx.trim).await {
                Ok(_) => report.sets_updated += 1,
                Err(e) if is_fatal_store_error(&e) => return Err(e.into()),
                Err(e) => {
                    warn!(set_number, error = %e, "updating derived prices failed");
                    entry.error = Some(e.to_string());
                }
            }
        }
        report.log.push(entry);
    }

    report.is_last_batch = !report.partial && offset + items.len() as u64 >= total;
    info!(
        prices_saved = report.prices_saved,
        sets_updated = report.sets_updated,
        is_last_batch = report.is_last_batch,
        partial = report.partial,
        "price batch finished"
    );
    Ok(PriceBatchOutcome::Progress(report))
}
