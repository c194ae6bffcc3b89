use std::collections::HashMap;
use strsim::jaro_winkler;

use super::normalize::{normalize_name, normalize_set_number, normalize_theme};
use crate::model::{CatalogItem, Category};

/// Minimum Jaro-Winkler score for a provider theme name to be treated as the
/// same theme as a catalog/configured one.
pub const MIN_THEME_SIMILARITY: f64 = 0.88;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Matched { item_id: i64 },
    Unmatched,
}

impl MatchResult {
    pub fn item_id(&self) -> Option<i64> {
        match self {
            MatchResult::Matched { item_id } => Some(*item_id),
            MatchResult::Unmatched => None,
        }
    }
}

/// Identity fields of one external record, as seen by the matcher.
#[derive(Debug, Clone, Copy)]
pub struct ExternalKey<'a> {
    pub category: Category,
    pub set_number: Option<&'a str>,
    pub name: Option<&'a str>,
}

impl<'a> ExternalKey<'a> {
    pub fn by_number(category: Category, set_number: &'a str) -> Self {
        Self {
            category,
            set_number: Some(set_number),
            name: None,
        }
    }
}

/// Immutable lookup over one batch's catalog rows, built once per batch.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    by_number: HashMap<(Category, String), i64>,
    by_name: HashMap<(Category, String), i64>,
    items: HashMap<i64, CatalogItem>,
}

impl CatalogIndex {
    /// When two rows share a key the first one wins.
    pub fn build(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        let mut index = Self::default();
        for item in items {
            if let Some(number) = item.set_number.as_deref().and_then(normalize_set_number) {
                index
                    .by_number
                    .entry((item.category, number))
                    .or_insert(item.id);
            }
            let name = normalize_name(&item.name);
            if !name.is_empty() {
                index.by_name.entry((item.category, name)).or_insert(item.id);
            }
            index.items.entry(item.id).or_insert(item);
        }
        index
    }

    pub fn get(&self, item_id: i64) -> Option<&CatalogItem> {
        self.items.get(&item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Exact normalized set number first, then case-insensitive exact name.
pub fn reconcile(external: &ExternalKey<'_>, index: &CatalogIndex) -> MatchResult {
    if let Some(number) = external.set_number.and_then(normalize_set_number) {
        if let Some(id) = index.by_number.get(&(external.category, number)) {
            return MatchResult::Matched { item_id: *id };
        }
    }
    if let Some(name) = external.name.map(normalize_name).filter(|n| !n.is_empty()) {
        if let Some(id) = index.by_name.get(&(external.category, name)) {
            return MatchResult::Matched { item_id: *id };
        }
    }
    MatchResult::Unmatched
}

/// Best fuzzy match of `candidate` among `known` theme names, if it clears
/// [`MIN_THEME_SIMILARITY`]. Exact normalized matches short-circuit.
pub fn match_theme<'a, S: AsRef<str>>(candidate: &str, known: &'a [S]) -> Option<&'a str> {
    let key = normalize_theme(candidate);
    if key.is_empty() {
        return None;
    }
    let mut best: Option<(&'a str, f64)> = None;
    for theme in known {
        let theme = theme.as_ref();
        let other = normalize_theme(theme);
        if other == key {
            return Some(theme);
        }
        let score = jaro_winkler(&key, &other);
        if score >= MIN_THEME_SIMILARITY && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((theme, score));
        }
    }
    best.map(|(t, _)| t)
}
