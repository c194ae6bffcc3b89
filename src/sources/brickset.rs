use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::http::{build_client, send_json, value_as_f64, value_as_i64};
use super::{
    Cursor, Page, RawExternalRecord, SetDetailsRecord, SourceAdapter, SourceError, UnitOfWork,
};
use crate::reconcile::normalize::classify_image;

const PROVIDER: &str = "brickset";

/// Set-catalog API (`getSets`), queried either by set number or by theme
/// with `pageSize`/`pageNumber` paging.
#[derive(Debug, Clone)]
pub struct BricksetAdapter {
    base_url: String,
    http: Client,
    api_key: Option<String>,
    user_hash: String,
    page_size: u32,
    page_delay: Duration,
}

impl BricksetAdapter {
    pub fn new(base_url: Option<&str>, timeout_secs: Option<u64>) -> Result<Self, reqwest::Error> {
        let base_url = base_url
            .unwrap_or("https://brickset.com/api/v3.asmx")
            .trim_end_matches('/')
            .to_string();
        let http = build_client(
            "TesoroTrack/1.0",
            Duration::from_secs(timeout_secs.unwrap_or(30)),
        )?;
        Ok(Self {
            base_url,
            http,
            api_key: None,
            user_hash: String::new(),
            page_size: 500,
            page_delay: Duration::from_millis(500),
        })
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }
}

/// The API wants the variant-qualified number.
fn variant_number(set_number: &str) -> String {
    let trimmed = set_number.trim();
    if trimmed.contains('-') {
        trimmed.to_string()
    } else {
        format!("{trimmed}-1")
    }
}

fn parse_date(v: Option<&Value>) -> Option<NaiveDate> {
    let s = v?.as_str()?;
    NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()
}

fn parse_set(v: &Value) -> Option<SetDetailsRecord> {
    let number = v.get("number")?.as_str()?.trim().to_string();
    let name = v.get("name")?.as_str()?.trim().to_string();
    if number.is_empty() {
        return None;
    }
    let us = v.get("LEGOCom").and_then(|l| l.get("US"));
    let availability = v
        .get("availability")
        .and_then(|a| a.as_str())
        .map(str::to_ascii_lowercase);
    let retired = availability
        .as_deref()
        .filter(|a| a.contains("retired"))
        .map(|_| true);
    let available_now = availability
        .as_deref()
        .map(|a| a.contains("retail") && !a.contains("retired"));
    let image_url = v
        .get("image")
        .and_then(|i| i.get("imageURL"))
        .and_then(|u| u.as_str())
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let image_kind = image_url.as_deref().map(classify_image);

    Some(SetDetailsRecord {
        number,
        name,
        theme: v
            .get("theme")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        year: v.get("year").and_then(value_as_i64).map(|y| y as i32),
        pieces: v.get("pieces").and_then(value_as_i64).map(|n| n as i32),
        retail_price_us: us.and_then(|u| u.get("retailPrice")).and_then(value_as_f64),
        retired,
        available_now,
        last_available: parse_date(us.and_then(|u| u.get("dateLastAvailable"))),
        image_url,
        image_kind,
    })
}

#[async_trait]
impl SourceAdapter for BricksetAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }

    async fn fetch_page(
        &self,
        unit: &UnitOfWork,
        cursor: &Cursor,
    ) -> Result<Page<RawExternalRecord>, SourceError> {
        let api_key = self.api_key.as_deref().ok_or(SourceError::NotConfigured {
            provider: PROVIDER,
            missing: "BRICKSET_API_KEY",
        })?;
        let page_number = match cursor {
            Cursor::Page(n) => *n,
            _ => 1,
        };
        let params = match unit {
            UnitOfWork::Set { set_number, .. } => json!({
                "setNumber": variant_number(set_number),
                "pageSize": self.page_size,
                "pageNumber": page_number,
                "extendedData": 0,
            }),
            UnitOfWork::Theme { name, .. } => json!({
                "theme": name,
                "pageSize": self.page_size,
                "pageNumber": page_number,
            }),
        };
        let unit_label = unit.to_string();
        let params = params.to_string();
        let req = self
            .http
            .get(format!("{}/getSets", self.base_url))
            .query(&[
                ("apiKey", api_key),
                ("userHash", self.user_hash.as_str()),
                ("params", params.as_str()),
            ]);
        let body = send_json(PROVIDER, &unit_label, req).await?;

        let status = body.get("status").and_then(|s| s.as_str()).unwrap_or("");
        if status != "success" {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("status was not success")
                .to_string();
            return Err(SourceError::Malformed {
                provider: PROVIDER,
                unit: unit_label,
                message,
            });
        }

        let records: Vec<RawExternalRecord> = body
            .get("sets")
            .and_then(|s| s.as_array())
            .map(|sets| {
                sets.iter()
                    .filter_map(parse_set)
                    .map(RawExternalRecord::SetDetails)
                    .collect()
            })
            .unwrap_or_default();
        let matches = body
            .get("matches")
            .and_then(value_as_i64)
            .map(|n| n.max(0) as u64);
        let seen = u64::from(page_number) * u64::from(self.page_size);
        let next = match matches {
            Some(total) if seen < total && !records.is_empty() => Some(Cursor::Page(page_number + 1)),
            _ => None,
        };

        Ok(Page {
            records,
            next,
            total: matches,
        })
    }
}
