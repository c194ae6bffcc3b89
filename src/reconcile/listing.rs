//! Completed-listing filter: decides whether an auction title is a single,
//! complete copy of the searched set and what condition it sold in.

use chrono::NaiveDate;
use std::collections::HashSet;

use super::normalize::normalize_set_number;
use crate::model::SaleCondition;
use crate::sources::ListingRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingVerdict {
    Accept(SaleCondition),
    Reject(&'static str),
}

/// Phrases that mark a listing as something other than one whole set.
const REJECT_PHRASES: &[(&str, &str)] = &[
    ("minifig only", "minifigure only"),
    ("minifigure only", "minifigure only"),
    ("minifigs only", "minifigure only"),
    ("figure only", "minifigure only"),
    ("instructions only", "instructions only"),
    ("manual only", "instructions only"),
    ("box only", "box only"),
    ("empty box", "box only"),
    ("no bricks", "box only"),
    ("stickers only", "parts only"),
    ("sticker sheet", "parts only"),
    ("parts only", "parts only"),
];

const REJECT_WORDS: &[(&str, &str)] = &[
    ("lot", "lot or bundle"),
    ("lots", "lot or bundle"),
    ("bundle", "lot or bundle"),
    ("bulk", "lot or bundle"),
    ("moc", "custom build"),
    ("custom", "custom build"),
    ("compatible", "knock-off"),
    ("replica", "knock-off"),
];

fn words(title: &str) -> Vec<String> {
    title
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Condition from the provider's own label first, then from title keywords.
/// Listings that say nothing are treated as used and complete.
pub fn condition_from(hint: Option<&str>, title: &str) -> SaleCondition {
    let title = title.to_lowercase();
    if title.contains("incomplete") || title.contains("missing") || title.contains("partial") {
        return SaleCondition::UsedIncomplete;
    }
    if let Some(hint) = hint.map(str::to_lowercase) {
        if hint.contains("new") && !hint.contains("other") && !hint.contains("open") {
            return SaleCondition::NewSealed;
        }
        if hint.contains("open box") || hint.contains("new other") {
            return SaleCondition::OpenBox;
        }
        if hint.contains("parts") {
            return SaleCondition::UsedIncomplete;
        }
    }
    let tokens = words(&title);
    let has = |w: &str| tokens.iter().any(|t| t == w);
    if title.contains("open box") || title.contains("opened") || has("unsealed") {
        SaleCondition::OpenBox
    } else if has("sealed") || has("nisb") || has("misb") || has("bnib") || has("new") {
        SaleCondition::NewSealed
    } else {
        SaleCondition::UsedComplete
    }
}

/// Title must contain the set number as its own token; variant suffixes on
/// either side are ignored ("75192-1" matches "75192").
fn mentions_set_number(title: &str, set_number: &str) -> bool {
    let Some(wanted) = normalize_set_number(set_number) else {
        return false;
    };
    title
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter_map(normalize_set_number)
        .any(|token| token == wanted)
}

pub fn classify_listing(listing: &ListingRecord, set_number: &str) -> ListingVerdict {
    if !(listing.price.is_finite() && listing.price > 0.0) {
        return ListingVerdict::Reject("non-positive price");
    }
    let title = listing.title.to_lowercase();
    for (phrase, reason) in REJECT_PHRASES {
        if title.contains(phrase) {
            return ListingVerdict::Reject(reason);
        }
    }
    let tokens = words(&title);
    for (word, reason) in REJECT_WORDS {
        if tokens.iter().any(|t| t == word) {
            return ListingVerdict::Reject(reason);
        }
    }
    if tokens.iter().any(|t| t.starts_with('x') && t[1..].parse::<u32>().map(|n| n > 1).unwrap_or(false)) {
        return ListingVerdict::Reject("lot or bundle");
    }
    if !mentions_set_number(&listing.title, set_number) {
        return ListingVerdict::Reject("set number not in title");
    }
    ListingVerdict::Accept(condition_from(listing.condition_hint.as_deref(), &listing.title))
}

/// Collapse near-duplicates (same normalized title, same price in cents, same
/// sold day) that relisting tools produce. Order of first sight is kept.
pub fn dedupe_listings(listings: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut seen: HashSet<(String, i64, Option<NaiveDate>)> = HashSet::new();
    listings
        .into_iter()
        .filter(|l| {
            let key = (
                l.title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
                (l.price * 100.0).round() as i64,
                l.sold_at.map(|d| d.date_naive()),
            );
            seen.insert(key)
        })
        .collect()
}
