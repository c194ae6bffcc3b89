//! Operator-triggered recomputation of derived prices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{is_fatal_store_error, JobContext, JobError, JobReport, NextBatch};
use crate::aggregate::recompute_item;
use crate::store::ItemFilter;

pub const DEFAULT_AGGREGATE_LIMIT: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    /// Explicit items; when absent, walk the whole catalog by offset.
    #[serde(default)]
    pub item_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: Option<u64>,
}

pub async fn run_aggregate(
    ctx: &JobContext,
    req: &AggregateRequest,
    now: DateTime<Utc>,
) -> Result<JobReport, JobError> {
    let limit = req.limit.unwrap_or(DEFAULT_AGGREGATE_LIMIT).clamp(1, 1000);
    let filter = ItemFilter {
        ids: req.item_ids.clone(),
        ..Default::default()
    };
    let items = ctx.store.list_items(&filter, req.offset, limit).await?;
    let mut report = JobReport::new(false);
    if req.item_ids.is_none() && items.len() as u64 == limit {
        report.next_batch = Some(NextBatch::Offset {
            offset: req.offset + limit,
        });
    }
    if let Some(ids) = req.item_ids.as_ref() {
        report.not_found = ids
            .iter()
            .filter(|id| !items.iter().any(|i| i.id == **id))
            .count() as u64;
    }

    for item in &items {
        report.processed += 1;
        match recompute_item(ctx.store.as_ref(), item.id, now, &ctx.trim).await {
            Ok(summary) if summary.sample_size > 0 => {
                report.updated += 1;
                report.line(format!(
                    "{}: avg {:?} new {:?} from {} sales ({} trimmed)",
                    item.id,
                    summary.avg_sale_price,
                    summary.new_avg_price,
                    summary.sample_size,
                    summary.trimmed
                ));
            }
            Ok(_) => {}
            Err(e) if is_fatal_store_error(&e) => return Err(e.into()),
            Err(e) => {
                warn!(item_id = item.id, error = %e, "recompute failed");
                report.line(format!("{}: {e}", item.id));
            }
        }
    }
    info!(processed = report.processed, updated = report.updated, "aggregation finished");
    Ok(report)
}
