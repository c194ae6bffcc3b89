use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::http::{build_client, send_json};
use super::{
    Cursor, Page, RawExternalRecord, SourceAdapter, SourceError, ThemeImageRecord, UnitOfWork,
};
use crate::reconcile::normalize::{classify_image, set_code_from_filename};

const PROVIDER: &str = "wiki";

/// MediaWiki `list=allimages` walker. A set unit searches by set-number
/// prefix, a theme unit by the theme name.
#[derive(Debug, Clone)]
pub struct WikiImageAdapter {
    api_url: String,
    http: Client,
    limit: u32,
    page_delay: Duration,
}

impl WikiImageAdapter {
    pub fn new(api_url: Option<&str>, timeout_secs: Option<u64>) -> Result<Self, reqwest::Error> {
        let api_url = api_url
            .unwrap_or("https://brickipedia.fandom.com/api.php")
            .to_string();
        let http = build_client(
            "TesoroTrack/1.0 (theme image sync)",
            Duration::from_secs(timeout_secs.unwrap_or(15)),
        )?;
        Ok(Self {
            api_url,
            http,
            limit: 500,
            page_delay: Duration::from_millis(300),
        })
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }
}

fn parse_image(v: &Value) -> Option<ThemeImageRecord> {
    let file_name = v.get("name").or_else(|| v.get("title"))?.as_str()?.to_string();
    let url = v.get("url")?.as_str()?.to_string();
    Some(ThemeImageRecord {
        set_code: set_code_from_filename(&file_name),
        kind: classify_image(&file_name),
        file_name,
        url,
    })
}

#[async_trait]
impl SourceAdapter for WikiImageAdapter {
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
        let prefix = match unit {
            UnitOfWork::Set { set_number, .. } => set_number.trim().to_string(),
            UnitOfWork::Theme { name, .. } => name.trim().replace(' ', "_"),
        };
        let unit_label = unit.to_string();
        let limit = self.limit.to_string();
        let mut req = self.http.get(&self.api_url).query(&[
            ("action", "query"),
            ("list", "allimages"),
            ("aiprefix", prefix.as_str()),
            ("ailimit", limit.as_str()),
            ("aiprop", "url"),
            ("format", "json"),
        ]);
        if let Cursor::Token(token) = cursor {
            req = req.query(&[("aicontinue", token.as_str())]);
        }
        let body = send_json(PROVIDER, &unit_label, req).await?;

        if let Some(err) = body.get("error") {
            let message = err
                .get("info")
                .and_then(|i| i.as_str())
                .unwrap_or("api error")
                .to_string();
            return Err(SourceError::Malformed {
                provider: PROVIDER,
                unit: unit_label,
                message,
            });
        }

        let records = body
            .get("query")
            .and_then(|q| q.get("allimages"))
            .and_then(|a| a.as_array())
            .map(|images| {
                images
                    .iter()
                    .filter_map(parse_image)
                    .map(RawExternalRecord::ThemeImage)
                    .collect()
            })
            .unwrap_or_default();
        let next = body
            .get("continue")
            .and_then(|c| c.get("aicontinue"))
            .and_then(|t| t.as_str())
            .map(|t| Cursor::Token(t.to_string()));

        Ok(Page {
            records,
            next,
            total: None,
        })
    }
}
