//! Assign wiki images to a theme's items, preferring packaging shots.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, instrument, warn};

use super::{is_fatal_store_error, JobContext, JobError, JobReport, NextBatch};
use crate::model::Category;
use crate::reconcile::{merge_fields, reconcile, CatalogIndex, ExternalKey, IncomingFields};
use crate::sources::{fetch_all, RawExternalRecord, UnitOfWork};
use crate::store::ItemFilter;

pub const DEFAULT_IMAGE_LIMIT: u64 = 50;
const IMAGE_PAGE_CAP: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeImagesRequest {
    pub theme: String,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
}

#[instrument(skip(ctx, req), fields(theme = %req.theme, offset = req.offset, dry_run = req.dry_run))]
pub async fn run_theme_images(
    ctx: &JobContext,
    req: &ThemeImagesRequest,
) -> Result<JobReport, JobError> {
    let theme = req.theme.trim();
    if theme.is_empty() {
        return Err(JobError::InvalidRequest("theme is required".into()));
    }
    let limit = req.limit.unwrap_or(DEFAULT_IMAGE_LIMIT).clamp(1, 500);
    let mut filter = ItemFilter::with_set_numbers().theme(theme);
    filter.category = req.category;
    let items = ctx.store.list_items(&filter, req.offset, limit).await?;
    let mut report = JobReport::new(req.dry_run);
    if items.is_empty() {
        report.line(format!("no numbered items in theme \"{theme}\" at offset {}", req.offset));
        return Ok(report);
    }
    if items.len() as u64 == limit {
        report.next_batch = Some(NextBatch::Offset {
            offset: req.offset + limit,
        });
    }

    let index = CatalogIndex::build(items.iter().cloned());
    let deadline = ctx.deadline();
    let mut candidates: HashMap<i64, IncomingFields> = HashMap::new();

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
        let page = match fetch_all(ctx.images.as_ref(), &unit, IMAGE_PAGE_CAP).await {
            Ok(page) => page,
            Err(e) if e.is_recoverable() => {
                warn!(set_number, provider = e.provider(), error = %e, "image lookup failed");
                report.line(format!("{set_number}: {e}"));
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut found = false;
        for record in page.records {
            let RawExternalRecord::ThemeImage(image) = record else {
                continue;
            };
            let Some(code) = image.set_code.as_deref() else {
                continue;
            };
            let key = ExternalKey::by_number(item.category, code);
            let Some(item_id) = reconcile(&key, &index).item_id() else {
                continue;
            };
            found |= item_id == item.id;
            let fields = IncomingFields {
                image: Some((image.url, image.kind)),
                ..Default::default()
            };
            candidates.entry(item_id).or_default().absorb(fields);
        }
        if !found {
            report.not_found += 1;
        }
    }

    for item in &items {
        let Some(fields) = candidates.get(&item.id) else {
            continue;
        };
        let patch = merge_fields(item, fields);
        let Some(url) = patch.image_url.as_deref() else {
            continue;
        };
        let label = item.set_number.as_deref().unwrap_or(&item.name);
        if req.dry_run {
            report.updated += 1;
            report.line(format!("[dry-run] {label}: would use {url}"));
            continue;
        }
        match ctx.store.apply_patch(item.id, &patch).await {
            Ok(()) => {
                report.updated += 1;
                report.line(format!("{label}: {url}"));
            }
            Err(e) if is_fatal_store_error(&e) => return Err(e.into()),
            Err(e) => {
                warn!(item_id = item.id, error = %e, "image update failed");
                report.line(format!("{label}: {e}"));
            }
        }
    }

    info!(
        processed = report.processed,
        updated = report.updated,
        "theme image batch finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fixtures::{context, ScriptedAdapter};
    use crate::model::{CatalogItem, ImageKind};
    use crate::sources::ThemeImageRecord;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn image(file: &str, code: &str, kind: ImageKind) -> RawExternalRecord {
        RawExternalRecord::ThemeImage(ThemeImageRecord {
            file_name: file.into(),
            url: format!("https://wiki.example/{file}"),
            set_code: Some(code.into()),
            kind,
        })
    }

    fn themed(id: i64, number: &str, image: Option<&str>) -> CatalogItem {
        let mut item = CatalogItem::new(id, Some(number), "set", Category::Lego);
        item.theme = Some("Star Wars".into());
        item.image_url = image.map(str::to_string);
        item
    }

    #[tokio::test]
    async fn prefers_box_art_and_keeps_existing_box_art() {
        let store = Arc::new(MemoryStore::with_items(vec![
            themed(1, "75192", Some("https://images.example/75192-1.jpg")),
            themed(2, "75257", Some("https://wiki.example/75257_Box.jpg")),
            themed(3, "75313", None),
        ]));
        let mut ctx = context(store.clone());
        ctx.images = Arc::new(
            ScriptedAdapter::default()
                .with(
                    "set lego:75192",
                    vec![
                        image("75192_Box.jpg", "75192", ImageKind::BoxArt),
                        image("75192-1.jpg", "75192", ImageKind::Render),
                    ],
                )
                .with(
                    "set lego:75257",
                    vec![image("75257-1.jpg", "75257", ImageKind::Render)],
                ),
        );

        let report = run_theme_images(
            &ctx,
            &ThemeImagesRequest {
                theme: "star wars".into(),
                category: None,
                offset: 0,
                limit: None,
                dry_run: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.updated, 1);
        assert_eq!(report.not_found, 1);
        assert_eq!(
            store.item(1).unwrap().image_url.as_deref(),
            Some("https://wiki.example/75192_Box.jpg")
        );
        assert_eq!(
            store.item(2).unwrap().image_url.as_deref(),
            Some("https://wiki.example/75257_Box.jpg")
        );
    }

    #[tokio::test]
    async fn exhausted_budget_leaves_rest_for_next_offset() {
        let store = Arc::new(MemoryStore::with_items(vec![
            themed(1, "75192", None),
            themed(2, "75257", None),
        ]));
        let mut ctx = context(store.clone());
        ctx.images = Arc::new(
            ScriptedAdapter::default()
                .with("set lego:75192", vec![image("75192_Box.jpg", "75192", ImageKind::BoxArt)])
                .with("set lego:75257", vec![image("75257_Box.jpg", "75257", ImageKind::BoxArt)]),
        );
        ctx.time_budget = std::time::Duration::ZERO;
        let mut req = ThemeImagesRequest {
            theme: "Star Wars".into(),
            category: None,
            offset: 0,
            limit: None,
            dry_run: false,
        };

        let report = run_theme_images(&ctx, &req).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.next_batch, Some(NextBatch::Offset { offset: 1 }));
        assert!(report
            .log
            .contains(&"75257: time budget exhausted; not processed".to_string()));
        assert_eq!(store.item(2).unwrap().image_url, None);

        req.offset = 1;
        let report = run_theme_images(&ctx, &req).await.unwrap();
        assert_eq!(report.next_batch, None);
        assert_eq!(
            store.item(2).unwrap().image_url.as_deref(),
            Some("https://wiki.example/75257_Box.jpg")
        );
    }

    #[tokio::test]
    async fn empty_theme_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store);
        let report = run_theme_images(
            &ctx,
            &ThemeImagesRequest {
                theme: "Technic".into(),
                category: None,
                offset: 0,
                limit: None,
                dry_run: true,
            },
        )
        .await
        .unwrap();
        assert!(report.success);
        assert_eq!(report.processed, 0);
    }
}
