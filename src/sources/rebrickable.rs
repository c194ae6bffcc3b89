use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::http::{build_client, send_json, value_as_i64};
use super::{
    CatalogEntryRecord, Cursor, Page, ProviderTheme, RawExternalRecord, SourceAdapter, SourceError,
    ThemeDirectory, UnitOfWork,
};

const PROVIDER: &str = "rebrickable";

/// Which catalog listing a theme unit walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogKind {
    #[default]
    Sets,
    Minifigs,
}

#[derive(Debug, Clone)]
pub struct RebrickableAdapter {
    base_url: String,
    http: Client,
    api_key: Option<String>,
    kind: CatalogKind,
    page_size: u32,
    page_delay: Duration,
}

impl RebrickableAdapter {
    pub fn new(base_url: Option<&str>, timeout_secs: Option<u64>) -> Result<Self, reqwest::Error> {
        let base_url = base_url
            .unwrap_or("https://rebrickable.com")
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
            kind: CatalogKind::Sets,
            page_size: 1000,
            page_delay: Duration::from_millis(1100),
        })
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_kind(mut self, kind: CatalogKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    fn authorized(&self, req: RequestBuilder) -> Result<RequestBuilder, SourceError> {
        let key = self.api_key.as_deref().ok_or(SourceError::NotConfigured {
            provider: PROVIDER,
            missing: "REBRICKABLE_API_KEY",
        })?;
        Ok(req.header("Authorization", format!("key {key}")))
    }
}

#[async_trait]
impl ThemeDirectory for RebrickableAdapter {
    async fn themes(&self) -> Result<Vec<ProviderTheme>, SourceError> {
        let mut out = Vec::new();
        let mut url = format!("{}/api/v3/lego/themes/?page_size=1000", self.base_url);
        loop {
            let req = self.authorized(self.http.get(&url))?;
            let body = send_json(PROVIDER, "themes", req).await?;
            let results = body
                .get("results")
                .and_then(|v| v.as_array())
                .ok_or_else(|| SourceError::Malformed {
                    provider: PROVIDER,
                    unit: "themes".into(),
                    message: "missing results array".into(),
                })?;
            out.extend(results.iter().filter_map(|t| {
                Some(ProviderTheme {
                    id: t.get("id").and_then(value_as_i64)?,
                    name: t.get("name")?.as_str()?.trim().to_string(),
                    parent_id: t.get("parent_id").and_then(value_as_i64),
                })
            }));
            match body.get("next").and_then(|v| v.as_str()) {
                Some(next) if !next.is_empty() => {
                    url = next.to_string();
                    tokio::time::sleep(self.page_delay).await;
                }
                _ => break,
            }
        }
        debug!(provider = PROVIDER, themes = out.len(), "loaded theme list");
        Ok(out)
    }
}

fn parse_entry(v: &Value) -> Option<CatalogEntryRecord> {
    let set_num = v.get("set_num")?.as_str()?.trim().to_string();
    let name = v.get("name")?.as_str()?.trim().to_string();
    if set_num.is_empty() || name.is_empty() {
        return None;
    }
    Some(CatalogEntryRecord {
        set_num,
        name,
        year: v.get("year").and_then(value_as_i64).map(|y| y as i32),
        num_parts: v.get("num_parts").and_then(value_as_i64).map(|n| n as i32),
        theme_id: v.get("theme_id").and_then(value_as_i64),
        image_url: v
            .get("set_img_url")
            .and_then(|u| u.as_str())
            .filter(|u| !u.is_empty())
            .map(str::to_string),
    })
}

#[async_trait]
impl SourceAdapter for RebrickableAdapter {
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
        let unit_label = unit.to_string();
        let malformed = |message: String| SourceError::Malformed {
            provider: PROVIDER,
            unit: unit_label.clone(),
            message,
        };
        let url = match cursor {
            Cursor::Url(next) => next.clone(),
            _ => {
                let UnitOfWork::Theme {
                    provider_id: Some(theme_id),
                    ..
                } = unit
                else {
                    return Err(malformed("catalog walk needs a provider theme id".into()));
                };
                match self.kind {
                    CatalogKind::Sets => format!(
                        "{}/api/v3/lego/sets/?theme_id={theme_id}&page_size={}",
                        self.base_url, self.page_size
                    ),
                    CatalogKind::Minifigs => format!(
                        "{}/api/v3/lego/minifigs/?in_theme_id={theme_id}&page_size={}",
                        self.base_url, self.page_size
                    ),
                }
            }
        };

        let req = self.authorized(self.http.get(&url))?;
        let body = send_json(PROVIDER, &unit_label, req).await?;
        let results = body
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| malformed("missing results array".into()))?;

        let records = results
            .iter()
            .filter_map(parse_entry)
            .map(RawExternalRecord::CatalogEntry)
            .collect();
        let next = body
            .get("next")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| Cursor::Url(s.to_string()));
        let total = body
            .get("count")
            .and_then(value_as_i64)
            .map(|n| n.max(0) as u64);

        Ok(Page {
            records,
            next,
            total,
        })
    }
}
