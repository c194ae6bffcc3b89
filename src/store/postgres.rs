use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, QueryBuilder, Row};
use tracing::{instrument, warn};

use super::{CatalogStore, ItemFilter, StoreError, UpsertOutcome};
use crate::model::{CatalogItem, ItemPatch, NewCatalogItem, SaleRecord};
use crate::util::db::Db;

const ITEM_COLUMNS: &str = "id, set_number, name, category, theme, year_released, piece_count, \
     retail_price, is_retired, year_retired, image_url, avg_sale_price, new_avg_price";

#[derive(Clone)]
pub struct PgCatalogStore {
    db: Db,
}

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &ItemFilter) {
    qb.push(" WHERE TRUE");
    if filter.with_set_number {
        qb.push(" AND set_number IS NOT NULL AND btrim(set_number) <> ''");
    }
    if let Some(category) = filter.category {
        qb.push(" AND category = ").push_bind(category.as_str());
    }
    if let Some(theme) = filter.theme.as_ref() {
        qb.push(" AND lower(theme) = lower(")
            .push_bind(theme.clone())
            .push(")");
    }
    if let Some(ids) = filter.ids.as_ref() {
        qb.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
    }
}

fn item_from_row(row: &PgRow) -> Result<CatalogItem, StoreError> {
    let category: String = row.try_get("category")?;
    Ok(CatalogItem {
        id: row.try_get("id")?,
        set_number: row.try_get("set_number")?,
        name: row.try_get("name")?,
        category: category
            .parse()
            .map_err(|e: anyhow::Error| StoreError::Query(e.to_string()))?,
        theme: row.try_get("theme")?,
        year_released: row.try_get("year_released")?,
        piece_count: row.try_get("piece_count")?,
        retail_price: row.try_get("retail_price")?,
        is_retired: row.try_get("is_retired")?,
        year_retired: row.try_get("year_retired")?,
        image_url: row.try_get("image_url")?,
        avg_sale_price: row.try_get("avg_sale_price")?,
        new_avg_price: row.try_get("new_avg_price")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT true")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn count_items(&self, filter: &ItemFilter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new("SELECT count(*) FROM catalog_items");
        push_filter(&mut qb, filter);
        let n: i64 = qb.build_query_scalar::<i64>().fetch_one(&self.db.pool).await?;
        Ok(n.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn list_items(
        &self,
        filter: &ItemFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogItem>, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM catalog_items"));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id OFFSET ")
            .push_bind(offset as i64)
            .push(" LIMIT ")
            .push_bind(limit as i64);
        let rows = qb.build().fetch_all(&self.db.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn upsert_item(&self, item: &NewCatalogItem) -> Result<UpsertOutcome, StoreError> {
        // xmax = 0 only for freshly inserted tuples.
        let row = sqlx::query(
            "INSERT INTO catalog_items \
                (set_number, name, category, theme, year_released, piece_count, image_url) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (set_number, category) DO UPDATE SET \
                name = EXCLUDED.name, \
                theme = COALESCE(catalog_items.theme, EXCLUDED.theme), \
                year_released = COALESCE(catalog_items.year_released, EXCLUDED.year_released), \
                piece_count = CASE WHEN COALESCE(catalog_items.piece_count, 0) = 0 \
                    THEN COALESCE(EXCLUDED.piece_count, catalog_items.piece_count) \
                    ELSE catalog_items.piece_count END, \
                image_url = COALESCE(catalog_items.image_url, EXCLUDED.image_url), \
                updated_at = now() \
             RETURNING id, (xmax = 0) AS inserted",
        )
        .bind(&item.set_number)
        .bind(&item.name)
        .bind(item.category.as_str())
        .bind(&item.theme)
        .bind(item.year_released)
        .bind(item.piece_count)
        .bind(&item.image_url)
        .fetch_one(&self.db.pool)
        .await?;
        let id: i64 = row.try_get("id")?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted(id)
        } else {
            UpsertOutcome::Updated(id)
        })
    }

    async fn apply_patch(&self, item_id: i64, patch: &ItemPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let res = sqlx::query(
            "UPDATE catalog_items SET \
                retail_price = COALESCE($2, retail_price), \
                piece_count = COALESCE($3, piece_count), \
                image_url = COALESCE($4, image_url), \
                is_retired = COALESCE($5, is_retired), \
                year_retired = COALESCE($6, year_retired), \
                updated_at = now() \
             WHERE id = $1",
        )
        .bind(item_id)
        .bind(patch.retail_price)
        .bind(patch.piece_count)
        .bind(&patch.image_url)
        .bind(patch.is_retired)
        .bind(patch.year_retired)
        .execute(&self.db.pool)
        .await?;
        if res.rows_affected() == 0 {
            warn!(item_id, "patch matched no catalog row");
        }
        Ok(())
    }

    #[instrument(skip(self, sales), fields(rows = sales.len()))]
    async fn insert_sales(&self, sales: &[SaleRecord]) -> Result<u64, StoreError> {
        if sales.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(
            "INSERT INTO sale_records (item_id, sale_price, sale_date, condition, listing_title) ",
        );
        qb.push_values(sales, |mut b, s| {
            b.push_bind(s.item_id)
                .push_bind(s.sale_price)
                .push_bind(s.sale_date)
                .push_bind(s.condition.as_str())
                .push_bind(s.listing_title.clone());
        });
        let res = qb.build().execute(&self.db.pool).await?;
        Ok(res.rows_affected())
    }

    async fn sales_since(
        &self,
        item_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<SaleRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT item_id, sale_price, sale_date, condition, listing_title \
             FROM sale_records WHERE item_id = $1 AND sale_date > $2 \
             ORDER BY sale_date",
        )
        .bind(item_id)
        .bind(since)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let condition: String = row.try_get("condition")?;
            out.push(SaleRecord {
                item_id: row.try_get("item_id")?,
                sale_price: row.try_get("sale_price")?,
                sale_date: row.try_get("sale_date")?,
                condition: condition
                    .parse()
                    .map_err(|e: anyhow::Error| StoreError::Query(e.to_string()))?,
                listing_title: row.try_get("listing_title")?,
            });
        }
        Ok(out)
    }

    async fn set_derived_prices(
        &self,
        item_id: i64,
        avg_sale_price: Option<f64>,
        new_avg_price: Option<f64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE catalog_items SET avg_sale_price = $2, new_avg_price = $3, updated_at = now() \
             WHERE id = $1",
        )
        .bind(item_id)
        .bind(avg_sale_price)
        .bind(new_avg_price)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}
