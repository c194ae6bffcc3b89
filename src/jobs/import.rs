//! Theme import from the parts catalog.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{is_fatal_store_error, JobContext, JobError, JobReport, NextBatch};
use crate::model::{Category, NewCatalogItem};
use crate::reconcile::normalize::normalize_theme;
use crate::reconcile::{match_theme, normalize_set_number};
use crate::sources::{fetch_all, CatalogEntryRecord, RawExternalRecord, UnitOfWork};
use crate::store::UpsertOutcome;

/// Pages walked per provider theme (1000 rows each).
pub const CATALOG_PAGE_CAP: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub theme: String,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub dry_run: bool,
}

/// The configured theme after `current`, compared by normalized name.
pub fn next_theme(themes: &[String], current: &str) -> Option<String> {
    let key = normalize_theme(current);
    let pos = themes.iter().position(|t| normalize_theme(t) == key)?;
    themes.get(pos + 1).cloned()
}

/// Import every set of one theme (and its sub-themes). Rows are keyed by
/// normalized set number; when a number shows up twice the later row wins.
#[instrument(skip(ctx, req), fields(theme = %req.theme, dry_run = req.dry_run))]
pub async fn run_import(ctx: &JobContext, req: &ImportRequest) -> Result<JobReport, JobError> {
    let theme = req.theme.trim();
    if theme.is_empty() {
        return Err(JobError::InvalidRequest("theme is required".into()));
    }
    let category = req.category.unwrap_or_default();
    let mut report = JobReport::new(req.dry_run);
    report.next_batch = next_theme(&ctx.import_themes, theme).map(|theme| NextBatch::Theme { theme });

    let provider_themes = match ctx.themes.themes().await {
        Ok(list) => list,
        Err(e) if e.is_recoverable() => {
            warn!(provider = e.provider(), error = %e, "theme list unavailable");
            report.success = false;
            report.line(format!("theme list unavailable: {e}"));
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };
    let names: Vec<&str> = provider_themes.iter().map(|t| t.name.as_str()).collect();
    let Some(matched_name) = match_theme(theme, &names) else {
        report.not_found += 1;
        report.line(format!("no provider theme resembles \"{theme}\""));
        return Ok(report);
    };
    let Some(root) = provider_themes.iter().find(|t| t.name == matched_name) else {
        report.not_found += 1;
        return Ok(report);
    };
    let units: Vec<UnitOfWork> = provider_themes
        .iter()
        .filter(|t| t.id == root.id || t.parent_id == Some(root.id))
        .map(|t| UnitOfWork::Theme {
            name: t.name.clone(),
            provider_id: Some(t.id),
        })
        .collect();
    let canonical = match_theme(theme, &ctx.import_themes)
        .map(str::to_string)
        .unwrap_or_else(|| root.name.clone());
    report.line(format!(
        "\"{theme}\" matched provider theme \"{}\" ({} sub-themes)",
        root.name,
        units.len().saturating_sub(1)
    ));

    let deadline = ctx.deadline();
    let mut rows: IndexMap<String, CatalogEntryRecord> = IndexMap::new();
    for unit in &units {
        if deadline.expired() {
            report.line(format!("time budget exhausted before {unit}"));
            break;
        }
        match fetch_all(ctx.catalog.as_ref(), unit, CATALOG_PAGE_CAP).await {
            Ok(page) => {
                for record in page.records {
                    if let RawExternalRecord::CatalogEntry(entry) = record {
                        if let Some(key) = normalize_set_number(&entry.set_num) {
                            rows.insert(key, entry);
                        }
                    }
                }
            }
            Err(e) if e.is_recoverable() => {
                warn!(unit = %unit, error = %e, "catalog walk failed; skipping theme");
                report.line(format!("{unit}: {e}"));
            }
            Err(e) => return Err(e.into()),
        }
    }

    for (set_number, entry) in rows {
        report.processed += 1;
        let item = NewCatalogItem {
            set_number,
            name: entry.name,
            category,
            theme: Some(canonical.clone()),
            year_released: entry.year,
            piece_count: entry.num_parts.filter(|n| *n > 0),
            image_url: entry.image_url,
        };
        if req.dry_run {
            report.updated += 1;
            report.line(format!("[dry-run] would upsert {} {}", item.set_number, item.name));
            continue;
        }
        match ctx.store.upsert_item(&item).await {
            Ok(UpsertOutcome::Inserted(id)) => {
                report.updated += 1;
                report.line(format!("inserted {} {} (id {id})", item.set_number, item.name));
            }
            Ok(UpsertOutcome::Updated(_)) => report.updated += 1,
            Err(e) if is_fatal_store_error(&e) => return Err(e.into()),
            Err(e) => {
                warn!(set_number = %item.set_number, error = %e, "upsert failed");
                report.line(format!("{}: {e}", item.set_number));
            }
        }
    }

    info!(
        processed = report.processed,
        updated = report.updated,
        "theme import finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fixtures::{context, ScriptedAdapter, StaticThemes};
    use crate::sources::ProviderTheme;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn entry(set_num: &str, name: &str, parts: i32) -> RawExternalRecord {
        RawExternalRecord::CatalogEntry(CatalogEntryRecord {
            set_num: set_num.into(),
            name: name.into(),
            year: Some(2020),
            num_parts: Some(parts),
            theme_id: Some(158),
            image_url: None,
        })
    }

    fn themes() -> StaticThemes {
        StaticThemes(vec![
            ProviderTheme {
                id: 158,
                name: "Star Wars".into(),
                parent_id: None,
            },
            ProviderTheme {
                id: 171,
                name: "Ultimate Collector Series".into(),
                parent_id: Some(158),
            },
            ProviderTheme {
                id: 1,
                name: "Technic".into(),
                parent_id: None,
            },
        ])
    }

    fn catalog() -> ScriptedAdapter {
        ScriptedAdapter::default()
            .with(
                "theme Star Wars",
                vec![entry("75257-1", "Millennium Falcon", 1351), entry("75192-1", "Falcon", 7541)],
            )
            .with(
                "theme Ultimate Collector Series",
                vec![entry("75192-1", "Millennium Falcon UCS", 7541)],
            )
    }

    fn request(dry_run: bool) -> ImportRequest {
        ImportRequest {
            theme: "star wars".into(),
            category: None,
            dry_run,
        }
    }

    #[tokio::test]
    async fn imports_theme_and_sub_themes_with_later_rows_winning() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = context(store.clone());
        ctx.themes = Arc::new(themes());
        ctx.catalog = Arc::new(catalog());

        let report = run_import(&ctx, &request(false)).await.unwrap();
        assert!(report.success);
        assert_eq!(report.processed, 2);
        assert_eq!(report.updated, 2);
        assert_eq!(
            report.next_batch,
            Some(NextBatch::Theme {
                theme: "Harry Potter".into()
            })
        );
        let items = store.items();
        assert_eq!(items.len(), 2);
        let ucs = items
            .iter()
            .find(|i| i.set_number.as_deref() == Some("75192"))
            .unwrap();
        assert_eq!(ucs.name, "Millennium Falcon UCS");
        assert_eq!(ucs.theme.as_deref(), Some("Star Wars"));
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = context(store.clone());
        ctx.themes = Arc::new(themes());
        ctx.catalog = Arc::new(catalog());
        run_import(&ctx, &request(false)).await.unwrap();
        let before = store.items();
        run_import(&ctx, &request(false)).await.unwrap();
        assert_eq!(store.items(), before);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = context(store.clone());
        ctx.themes = Arc::new(themes());
        ctx.catalog = Arc::new(catalog());
        let report = run_import(&ctx, &request(true)).await.unwrap();
        assert_eq!(report.updated, 2);
        assert!(report.dry_run);
        assert!(store.items().is_empty());
    }

    #[tokio::test]
    async fn unknown_theme_counts_as_not_found() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = context(store);
        ctx.themes = Arc::new(themes());
        let report = run_import(
            &ctx,
            &ImportRequest {
                theme: "Technic".into(),
                category: Some(Category::Lego),
                dry_run: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.next_batch, None);

        let mut ctx = context(Arc::new(MemoryStore::new()));
        ctx.themes = Arc::new(themes());
        let report = run_import(
            &ctx,
            &ImportRequest {
                theme: "Duplo".into(),
                category: None,
                dry_run: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.not_found, 1);
    }

    #[test]
    fn next_theme_walks_configured_list() {
        let themes = vec!["Star Wars".to_string(), "Technic".to_string()];
        assert_eq!(next_theme(&themes, "star-wars").as_deref(), Some("Technic"));
        assert_eq!(next_theme(&themes, "Technic"), None);
        assert_eq!(next_theme(&themes, "City"), None);
    }
}
