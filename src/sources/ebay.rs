use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::http::{build_client, send_json, value_as_f64, value_as_i64};
use super::{
    Cursor, ListingRecord, Page, RawExternalRecord, SourceAdapter, SourceError, UnitOfWork,
};

const PROVIDER: &str = "ebay";

/// Completed-listing search (Finding API `findCompletedItems`).
///
/// One unit is one set number; pages are 1-based `paginationInput.pageNumber`.
/// The Finding API wraps every scalar in a one-element array, hence [`first`].
#[derive(Debug, Clone)]
pub struct EbayAdapter {
    base_url: String,
    http: Client,
    app_id: Option<String>,
    entries_per_page: u32,
    page_delay: Duration,
}

impl EbayAdapter {
    pub fn new(base_url: Option<&str>, timeout_secs: Option<u64>) -> Result<Self, reqwest::Error> {
        let base_url = base_url
            .unwrap_or("https://svcs.ebay.com/services/search/FindingService/v1")
            .trim_end_matches('/')
            .to_string();
        let http = build_client(
            "TesoroTrack/1.0",
            Duration::from_secs(timeout_secs.unwrap_or(20)),
        )?;
        Ok(Self {
            base_url,
            http,
            app_id: None,
            entries_per_page: 100,
            page_delay: Duration::from_millis(1100),
        })
    }

    pub fn with_app_id(mut self, app_id: Option<String>) -> Self {
        self.app_id = app_id.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }
}

fn first<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    v.get(key).and_then(|a| a.as_array()).and_then(|a| a.first())
}

fn first_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    first(v, key).and_then(|x| x.as_str())
}

fn parse_item(item: &Value) -> Option<ListingRecord> {
    let listing_id = first_str(item, "itemId")?.to_string();
    let title = first_str(item, "title")?.trim().to_string();
    let selling = first(item, "sellingStatus")?;
    if let Some(state) = first_str(selling, "sellingState") {
        if state != "EndedWithSales" {
            return None;
        }
    }
    let price_obj = first(selling, "convertedCurrentPrice").or_else(|| first(selling, "currentPrice"))?;
    let price = price_obj.get("__value__").and_then(value_as_f64)?;
    let currency = price_obj
        .get("@currencyId")
        .and_then(|v| v.as_str())
        .unwrap_or("USD")
        .to_string();
    let sold_at = first(item, "listingInfo")
        .and_then(|l| first_str(l, "endTime"))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    let condition_hint = first(item, "condition")
        .and_then(|c| first_str(c, "conditionDisplayName"))
        .map(str::to_string);
    Some(ListingRecord {
        listing_id,
        title,
        price,
        currency,
        sold_at,
        condition_hint,
    })
}

#[async_trait]
impl SourceAdapter for EbayAdapter {
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
        let app_id = self.app_id.as_deref().ok_or(SourceError::NotConfigured {
            provider: PROVIDER,
            missing: "EBAY_APP_ID",
        })?;
        let UnitOfWork::Set {
            set_number,
            category,
        } = unit
        else {
            return Err(SourceError::Malformed {
                provider: PROVIDER,
                unit: unit.to_string(),
                message: "listing search needs a set number".into(),
            });
        };
        let page_number = match cursor {
            Cursor::Page(n) => *n,
            _ => 1,
        };
        let keywords = format!("{} {}", category.search_prefix(), set_number);
        let unit_label = unit.to_string();

        let req = self.http.get(&self.base_url).query(&[
            ("OPERATION-NAME", "findCompletedItems"),
            ("SERVICE-VERSION", "1.13.0"),
            ("SECURITY-APPNAME", app_id),
            ("RESPONSE-DATA-FORMAT", "JSON"),
            ("REST-PAYLOAD", ""),
            ("keywords", keywords.as_str()),
            ("itemFilter(0).name", "SoldItemsOnly"),
            ("itemFilter(0).value", "true"),
            ("sortOrder", "EndTimeSoonest"),
        ]);
        let req = req.query(&[
            ("paginationInput.entriesPerPage", self.entries_per_page.to_string()),
            ("paginationInput.pageNumber", page_number.to_string()),
        ]);
        let body = send_json(PROVIDER, &unit_label, req).await?;

        let malformed = |message: String| SourceError::Malformed {
            provider: PROVIDER,
            unit: unit_label.clone(),
            message,
        };
        let resp = first(&body, "findCompletedItemsResponse")
            .ok_or_else(|| malformed("missing findCompletedItemsResponse".into()))?;
        let ack = first_str(resp, "ack").unwrap_or("Failure");
        if ack != "Success" && ack != "Warning" {
            let message = first(resp, "errorMessage")
                .and_then(|e| first(e, "error"))
                .and_then(|e| first_str(e, "message"))
                .unwrap_or("request not acknowledged")
                .to_string();
            return Err(malformed(format!("ack={ack}: {message}")));
        }

        let records: Vec<RawExternalRecord> = first(resp, "searchResult")
            .and_then(|r| r.get("item"))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(parse_item)
                    .map(RawExternalRecord::Listing)
                    .collect()
            })
            .unwrap_or_default();

        let pagination = first(resp, "paginationOutput");
        let total = pagination
            .and_then(|p| first(p, "totalEntries"))
            .and_then(value_as_i64)
            .map(|n| n.max(0) as u64);
        let total_pages = pagination
            .and_then(|p| first(p, "totalPages"))
            .and_then(value_as_i64)
            .unwrap_or(0);
        let next = (i64::from(page_number) < total_pages).then(|| Cursor::Page(page_number + 1));

        Ok(Page {
            records,
            next,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Category;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;
    use std::net::TcpListener;

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn unit() -> UnitOfWork {
        UnitOfWork::Set {
            set_number: "75192".into(),
            category: Category::Lego,
        }
    }

    fn item(id: &str, title: &str, price: &str, state: &str) -> Value {
        json!({
            "itemId": [id],
            "title": [title],
            "sellingStatus": [{
                "currentPrice": [{ "@currencyId": "USD", "__value__": price }],
                "sellingState": [state]
            }],
            "listingInfo": [{ "endTime": ["2024-05-01T12:00:00.000Z"] }],
            "condition": [{ "conditionDisplayName": ["New"] }]
        })
    }

    #[tokio::test]
    async fn parses_sold_listings_and_pagination() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/finding")
                .query_param("keywords", "LEGO 75192")
                .query_param("paginationInput.pageNumber", "1");
            then.status(200).json_body(json!({
                "findCompletedItemsResponse": [{
                    "ack": ["Success"],
                    "searchResult": [{
                        "@count": "2",
                        "item": [
                            item("1", "LEGO 75192 Millennium Falcon NEW SEALED", "799.99", "EndedWithSales"),
                            item("2", "LEGO 75192 Millennium Falcon", "650.00", "EndedWithoutSales")
                        ]
                    }],
                    "paginationOutput": [{
                        "pageNumber": ["1"],
                        "totalPages": ["3"],
                        "totalEntries": ["250"]
                    }]
                }]
            }));
        });

        let adapter = EbayAdapter::new(Some(&server.url("/finding")), Some(5))
            .unwrap()
            .with_app_id(Some("app".into()));
        let page = adapter.fetch_page(&unit(), &Cursor::Start).await.unwrap();
        mock.assert();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.total, Some(250));
        assert_eq!(page.next, Some(Cursor::Page(2)));
        let RawExternalRecord::Listing(listing) = &page.records[0] else {
            panic!("expected listing");
        };
        assert_eq!(listing.price, 799.99);
        assert_eq!(listing.condition_hint.as_deref(), Some("New"));
        assert!(listing.sold_at.is_some());
    }

    #[tokio::test]
    async fn non_success_status_is_recoverable() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/finding");
            then.status(500).body("upstream exploded");
        });
        let adapter = EbayAdapter::new(Some(&server.url("/finding")), Some(5))
            .unwrap()
            .with_app_id(Some("app".into()));
        let err = adapter.fetch_page(&unit(), &Cursor::Start).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, SourceError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn missing_app_id_is_not_configured() {
        let adapter = EbayAdapter::new(None, Some(5)).unwrap();
        let err = adapter.fetch_page(&unit(), &Cursor::Start).await.unwrap_err();
        assert!(!err.is_recoverable());
    }
}
