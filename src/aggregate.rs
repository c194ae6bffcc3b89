//! Derived price fields from recent sales.
//!
//! Averages are taken over a trailing window and filtered with a median
//! absolute deviation (MAD) cut so one mislabeled listing cannot drag the
//! mean. Re-running over the same rows yields the same numbers.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::model::{SaleCondition, SaleRecord};
use crate::store::{CatalogStore, StoreError};

pub const PRICE_WINDOW_DAYS: i64 = 90;

/// Scale factor turning MAD into a standard-deviation estimate for normal data.
const MAD_SCALE: f64 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimPolicy {
    /// Keep values within `mad_multiplier * 1.4826 * MAD` of the median.
    pub mad_multiplier: f64,
    /// Below this many samples nothing is trimmed.
    pub min_samples: usize,
    /// Relative band around the median used when MAD is zero.
    pub zero_mad_band: f64,
}

impl Default for TrimPolicy {
    fn default() -> Self {
        Self {
            mad_multiplier: 3.0,
            min_samples: 3,
            zero_mad_band: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSummary {
    pub avg_sale_price: Option<f64>,
    pub new_avg_price: Option<f64>,
    pub sample_size: usize,
    pub trimmed: usize,
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Mean of the values that survive the outlier cut, plus how many were cut.
pub fn trimmed_mean(values: &[f64], policy: &TrimPolicy) -> Option<(f64, usize)> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted.len() < policy.min_samples {
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        return Some((mean, 0));
    }

    let med = median(&sorted);
    let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - med).abs()).collect();
    deviations.sort_by(|a, b| a.total_cmp(b));
    let mad = median(&deviations);
    let limit = if mad > 0.0 {
        policy.mad_multiplier * MAD_SCALE * mad
    } else {
        policy.zero_mad_band * med.abs()
    };

    let kept: Vec<f64> = sorted
        .iter()
        .copied()
        .filter(|v| (v - med).abs() <= limit)
        .collect();
    if kept.is_empty() {
        return Some((med, sorted.len()));
    }
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    Some((mean, sorted.len() - kept.len()))
}

/// Sales inside `(now - window, now]`, with exact repeats collapsed.
fn in_window<'a>(sales: &'a [SaleRecord], now: DateTime<Utc>) -> Vec<&'a SaleRecord> {
    let since = now - Duration::days(PRICE_WINDOW_DAYS);
    let mut seen: HashSet<(String, i64, NaiveDate)> = HashSet::new();
    sales
        .iter()
        .filter(|s| s.sale_date > since && s.sale_date <= now)
        .filter(|s| {
            seen.insert((
                s.listing_title.trim().to_lowercase(),
                (s.sale_price * 100.0).round() as i64,
                s.sale_date.date_naive(),
            ))
        })
        .collect()
}

pub fn summarize(sales: &[SaleRecord], now: DateTime<Utc>, policy: &TrimPolicy) -> PriceSummary {
    let window = in_window(sales, now);
    let all: Vec<f64> = window.iter().map(|s| s.sale_price).collect();
    let sealed: Vec<f64> = window
        .iter()
        .filter(|s| s.condition == SaleCondition::NewSealed)
        .map(|s| s.sale_price)
        .collect();

    let overall = trimmed_mean(&all, policy);
    let new_only = trimmed_mean(&sealed, policy);
    PriceSummary {
        avg_sale_price: overall.map(|(m, _)| round_cents(m)),
        new_avg_price: new_only.map(|(m, _)| round_cents(m)),
        sample_size: window.len(),
        trimmed: overall.map(|(_, t)| t).unwrap_or(0),
    }
}

/// Reload an item's recent sales and persist its derived prices. Items with
/// no sales in the window keep their previous values.
pub async fn recompute_item(
    store: &dyn CatalogStore,
    item_id: i64,
    now: DateTime<Utc>,
    policy: &TrimPolicy,
) -> Result<PriceSummary, StoreError> {
    let since = now - Duration::days(PRICE_WINDOW_DAYS);
    let sales = store.sales_since(item_id, since).await?;
    let summary = summarize(&sales, now, policy);
    if summary.sample_size > 0 {
        store
            .set_derived_prices(item_id, summary.avg_sale_price, summary.new_avg_price)
            .await?;
    }
    debug!(
        item_id,
        samples = summary.sample_size,
        trimmed = summary.trimmed,
        avg = ?summary.avg_sale_price,
        "recomputed derived prices"
    );
    Ok(summary)
}
