//! Backfill retail price, piece count, retirement and images from the
//! set-catalog API, one id-ordered slice per call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use super::{is_fatal_store_error, JobContext, JobError, JobReport, NextBatch};
use crate::model::Category;
use crate::reconcile::{
    merge_fields, reconcile, retirement_signal, CatalogIndex, ExternalKey, IncomingFields,
};
use crate::sources::{fetch_all, RawExternalRecord, SetDetailsRecord, UnitOfWork};
use crate::store::ItemFilter;

pub const DEFAULT_ENRICH_LIMIT: u64 = 25;
pub const MAX_ENRICH_LIMIT: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichRequest {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub dry_run: bool,
}

fn incoming_from(record: &SetDetailsRecord, now: DateTime<Utc>) -> IncomingFields {
    IncomingFields {
        retail_price: record.retail_price_us,
        piece_count: record.pieces,
        image: record
            .image_url
            .clone()
            .zip(record.image_kind),
        retirement: retirement_signal(
            record.retired,
            record.last_available,
            record.available_now,
            now.date_naive(),
        ),
    }
}

#[instrument(skip(ctx, req), fields(offset = req.offset, dry_run = req.dry_run))]
pub async fn run_enrich(
    ctx: &JobContext,
    req: &EnrichRequest,
    now: DateTime<Utc>,
) -> Result<JobReport, JobError> {
    let limit = req.limit.unwrap_or(DEFAULT_ENRICH_LIMIT);
    if limit == 0 || limit > MAX_ENRICH_LIMIT {
        return Err(JobError::InvalidRequest(format!(
            "limit must be between 1 and {MAX_ENRICH_LIMIT}"
        )));
    }
    let mut filter = ItemFilter::with_set_numbers();
    filter.category = req.category;
    let items = ctx.store.list_items(&filter, req.offset, limit).await?;
    let mut report = JobReport::new(req.dry_run);
    if items.is_empty() {
        report.line(format!("no items at offset {}", req.offset));
        return Ok(report);
    }
    if items.len() as u64 == limit {
        report.next_batch = Some(NextBatch::Offset {
            offset: req.offset + limit,
        });
    }

    let index = CatalogIndex::build(items.iter().cloned());
    let deadline = ctx.deadline();
    let mut incoming: HashMap<i64, IncomingFields> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();

    for (position, item) in items.iter().enumerate() {
        if position > 0 && deadline.expired() {
            report.cut_short(&items[position..], req.offset + position as u64);
            break;
        }
        let Some(set_number) = item.set_number.as_deref() else {
            continue;
        };
        report.processed += 1;
        let unit = UnitOfWork::Set {
            set_number: set_number.to_string(),
            category: item.category,
        };
        let page = match fetch_all(ctx.set_details.as_ref(), &unit, 1).await {
            Ok(page) => page,
            Err(e) if e.is_recoverable() => {
                warn!(set_number, provider = e.provider(), error = %e, "set lookup failed");
                report.line(format!("{set_number}: {e}"));
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut found = false;
        for record in page.records {
            let RawExternalRecord::SetDetails(details) = record else {
                continue;
            };
            let key = ExternalKey {
                category: item.category,
                set_number: Some(&details.number),
                name: Some(&details.name),
            };
            let Some(item_id) = reconcile(&key, &index).item_id() else {
                debug!(number = %details.number, "set details did not match this batch");
                continue;
            };
            found |= item_id == item.id;
            let fields = incoming_from(&details, now);
            match incoming.get_mut(&item_id) {
                Some(acc) => acc.absorb(fields),
                None => {
                    order.push(item_id);
                    incoming.insert(item_id, fields);
                }
            }
        }
        if !found {
            report.not_found += 1;
            report.line(format!("{set_number}: not found"));
        }
    }

    for item_id in order {
        let (Some(current), Some(fields)) = (index.get(item_id), incoming.get(&item_id)) else {
            continue;
        };
        let patch = merge_fields(current, fields);
        if patch.is_empty() {
            continue;
        }
        let label = current.set_number.as_deref().unwrap_or(&current.name);
        let changed = patch.changed_fields().join(", ");
        if req.dry_run {
            report.updated += 1;
            report.line(format!("[dry-run] {label}: would set {changed}"));
            continue;
        }
        match ctx.store.apply_patch(item_id, &patch).await {
            Ok(()) => {
                report.updated += 1;
                report.line(format!("{label}: set {changed}"));
            }
            Err(e) if is_fatal_store_error(&e) => return Err(e.into()),
            Err(e) => {
                warn!(item_id, error = %e, "patch failed");
                report.line(format!("{label}: {e}"));
            }
        }
    }

    info!(
        processed = report.processed,
        updated = report.updated,
        not_found = report.not_found,
        "enrichment batch finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fixtures::{context, ScriptedAdapter};
    use crate::model::{CatalogItem, ImageKind};
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn details(number: &str) -> SetDetailsRecord {
        SetDetailsRecord {
            number: number.into(),
            name: "whatever".into(),
            theme: Some("Star Wars".into()),
            year: Some(2017),
            pieces: None,
            retail_price_us: None,
            retired: None,
            available_now: None,
            last_available: None,
            image_url: None,
            image_kind: None,
        }
    }

    fn items() -> Vec<CatalogItem> {
        let mut falcon = CatalogItem::new(1, Some("75192"), "Millennium Falcon", Category::Lego);
        falcon.retail_price = Some(799.99);
        let ucs = CatalogItem::new(2, Some("10179"), "UCS Falcon", Category::Lego);
        let missing = CatalogItem::new(3, Some("99999"), "Unknown", Category::Lego);
        vec![falcon, ucs, missing]
    }

    fn provider() -> ScriptedAdapter {
        let mut falcon = details("75192");
        falcon.retail_price_us = Some(849.99);
        falcon.pieces = Some(7541);
        falcon.available_now = Some(true);
        let mut ucs = details("10179");
        ucs.retail_price_us = Some(499.99);
        ucs.pieces = Some(5195);
        ucs.last_available = NaiveDate::from_ymd_opt(2010, 12, 31);
        ucs.image_url = Some("https://images.example/10179-1.jpg".into());
        ucs.image_kind = Some(ImageKind::Render);
        ScriptedAdapter::default()
            .with("set lego:75192", vec![RawExternalRecord::SetDetails(falcon)])
            .with("set lego:10179", vec![RawExternalRecord::SetDetails(ucs)])
    }

    #[tokio::test]
    async fn fills_gaps_without_overwriting() {
        let store = Arc::new(MemoryStore::with_items(items()));
        let mut ctx = context(store.clone());
        ctx.set_details = Arc::new(provider());

        let report = run_enrich(&ctx, &EnrichRequest::default(), now()).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.not_found, 1);
        assert_eq!(report.next_batch, None);

        let falcon = store.item(1).unwrap();
        assert_eq!(falcon.retail_price, Some(799.99));
        assert_eq!(falcon.piece_count, Some(7541));
        assert!(!falcon.is_retired);

        let ucs = store.item(2).unwrap();
        assert_eq!(ucs.retail_price, Some(499.99));
        assert!(ucs.is_retired);
        assert_eq!(ucs.year_retired, Some(2010));
        assert_eq!(ucs.image_url.as_deref(), Some("https://images.example/10179-1.jpg"));
    }

    #[tokio::test]
    async fn pages_by_offset_and_dry_run_is_read_only() {
        let store = Arc::new(MemoryStore::with_items(items()));
        let mut ctx = context(store.clone());
        ctx.set_details = Arc::new(provider());
        let req = EnrichRequest {
            offset: 0,
            limit: Some(2),
            dry_run: true,
            ..Default::default()
        };
        let report = run_enrich(&ctx, &req, now()).await.unwrap();
        assert_eq!(report.next_batch, Some(NextBatch::Offset { offset: 2 }));
        assert_eq!(report.updated, 2);
        assert_eq!(store.item(2).unwrap().retail_price, None);

        let tail = run_enrich(
            &ctx,
            &EnrichRequest {
                offset: 2,
                limit: Some(2),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap();
        assert_eq!(tail.processed, 1);
        assert_eq!(tail.next_batch, None);
    }

    #[tokio::test]
    async fn exhausted_budget_resumes_at_first_untouched_item() {
        let store = Arc::new(MemoryStore::with_items(items()));
        let mut ctx = context(store.clone());
        ctx.set_details = Arc::new(provider());
        ctx.time_budget = std::time::Duration::ZERO;

        let report = run_enrich(&ctx, &EnrichRequest::default(), now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.next_batch, Some(NextBatch::Offset { offset: 1 }));
        assert_eq!(store.item(2).unwrap().retail_price, None);

        let mut next = report.next_batch;
        let mut calls = 1;
        while let Some(NextBatch::Offset { offset }) = next {
            let req = EnrichRequest {
                offset,
                ..Default::default()
            };
            next = run_enrich(&ctx, &req, now()).await.unwrap().next_batch;
            calls += 1;
        }
        assert_eq!(calls, 3);
        assert_eq!(store.item(1).unwrap().piece_count, Some(7541));
        assert_eq!(store.item(2).unwrap().retail_price, Some(499.99));
    }

    #[tokio::test]
    async fn provider_failure_is_scoped_to_one_set() {
        let store = Arc::new(MemoryStore::with_items(items()));
        let mut ctx = context(store.clone());
        ctx.set_details = Arc::new(provider().failing("set lego:75192"));
        let report = run_enrich(&ctx, &EnrichRequest::default(), now()).await.unwrap();
        assert_eq!(report.updated, 1);
        assert!(store.item(2).unwrap().is_retired);
    }
}
