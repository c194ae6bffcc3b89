//! Transport between the orchestrator and the price batch job.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::jobs::{
    run_price_batch, BatchLogEntry, JobContext, JobError, PriceBatchOutcome, PriceBatchRequest,
};
use crate::sources::http::{build_client, truncate_for_log};

pub const PRICE_UPDATE_PATH: &str = "/api/v1/jobs/price-update";

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint unreachable: {0}")]
    Transport(String),
    #[error("endpoint returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected endpoint response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchProgress {
    pub saved: u64,
    pub updated: u64,
    pub total_items: Option<u64>,
    pub is_last_batch: bool,
    /// The batch stopped early; `processed_through` items of it are done.
    pub partial: bool,
    pub processed_through: u32,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchReply {
    /// Nothing left at this index.
    Done,
    Progress(BatchProgress),
}

#[async_trait]
pub trait BatchEndpoint: Send + Sync {
    /// Run `batch`, skipping the first `skip` items of it.
    async fn run_batch(
        &self,
        batch: u32,
        batch_size: u32,
        skip: u32,
    ) -> Result<BatchReply, EndpointError>;
}

pub fn format_log_entry(entry: &BatchLogEntry) -> String {
    let head = if entry.set.is_empty() {
        entry.set_number.clone()
    } else {
        format!("{} ({})", entry.set, entry.set_number)
    };
    match (&entry.error, entry.matched) {
        (Some(err), _) => format!("{head}: error: {err}"),
        (None, Some(matched)) => match entry.ebay_total {
            Some(total) => format!("{head}: {matched} matched of {total}"),
            None => format!("{head}: {matched} matched"),
        },
        (None, None) => format!("{head}: no result"),
    }
}

fn progress_from(outcome: PriceBatchOutcome) -> BatchReply {
    match outcome {
        PriceBatchOutcome::Done { .. } => BatchReply::Done,
        PriceBatchOutcome::Progress(report) => BatchReply::Progress(BatchProgress {
            saved: report.prices_saved,
            updated: report.sets_updated,
            total_items: report.total_sets_with_numbers,
            is_last_batch: report.is_last_batch,
            partial: report.partial,
            processed_through: report.processed_through,
            log: report.log.iter().map(format_log_entry).collect(),
        }),
    }
}

/// Runs the batch job inside this process against a [`JobContext`].
pub struct InProcessEndpoint {
    ctx: JobContext,
}

impl InProcessEndpoint {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl BatchEndpoint for InProcessEndpoint {
    async fn run_batch(
        &self,
        batch: u32,
        batch_size: u32,
        skip: u32,
    ) -> Result<BatchReply, EndpointError> {
        let req = PriceBatchRequest {
            batch,
            batch_size,
            skip,
        };
        let outcome = run_price_batch(&self.ctx, req, Utc::now()).await?;
        Ok(progress_from(outcome))
    }
}

/// Calls a remote API server's price-update route with bearer auth.
#[derive(Debug, Clone)]
pub struct HttpBatchEndpoint {
    url: String,
    secret: Option<String>,
    http: Client,
}

// Fields are optional on the wire: older servers omit some of them.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireBatchResponse {
    done: bool,
    prices_saved: u64,
    sets_updated: u64,
    total_sets_with_numbers: Option<u64>,
    is_last_batch: bool,
    partial: bool,
    processed_through: u32,
    log: Vec<WireLogEntry>,
    error: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireLogEntry {
    set: String,
    set_number: String,
    matched: Option<u64>,
    error: Option<String>,
    ebay_total: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireError {
    error: Option<String>,
    detail: Option<String>,
}

impl HttpBatchEndpoint {
    pub fn new(
        base_url: &str,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: format!("{}{PRICE_UPDATE_PATH}", base_url.trim_end_matches('/')),
            secret: secret.filter(|s| !s.is_empty()),
            http: build_client("TesoroTrack-driver/1.0", timeout)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn decode_reply(body: &str) -> Result<BatchReply, EndpointError> {
    let wire: WireBatchResponse = serde_json::from_str(body)
        .map_err(|e| EndpointError::Malformed(format!("{e}: {}", truncate_for_log(body.to_string(), 200))))?;
    if let Some(error) = wire.error {
        let message = match wire.detail {
            Some(detail) => format!("{error}: {detail}"),
            None => error,
        };
        return Err(EndpointError::Malformed(format!("error body with success status: {message}")));
    }
    if wire.done {
        return Ok(BatchReply::Done);
    }
    let log = wire
        .log
        .into_iter()
        .map(|e| {
            format_log_entry(&BatchLogEntry {
                set: e.set,
                set_number: e.set_number,
                matched: e.matched,
                error: e.error,
                ebay_total: e.ebay_total,
            })
        })
        .collect();
    Ok(BatchReply::Progress(BatchProgress {
        saved: wire.prices_saved,
        updated: wire.sets_updated,
        total_items: wire.total_sets_with_numbers,
        is_last_batch: wire.is_last_batch && !wire.partial,
        partial: wire.partial,
        processed_through: wire.processed_through,
        log,
    }))
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<WireError>(body) {
        Ok(WireError {
            error: Some(error),
            detail: Some(detail),
        }) => format!("{error}: {detail}"),
        Ok(WireError {
            error: Some(error), ..
        }) => error,
        _ => truncate_for_log(body.to_string(), 300),
    }
}

#[async_trait]
impl BatchEndpoint for HttpBatchEndpoint {
    async fn run_batch(
        &self,
        batch: u32,
        batch_size: u32,
        skip: u32,
    ) -> Result<BatchReply, EndpointError> {
        let mut req = self.http.post(&self.url).json(&PriceBatchRequest {
            batch,
            batch_size,
            skip,
        });
        if let Some(secret) = &self.secret {
            req = req.bearer_auth(secret);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| EndpointError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| EndpointError::Transport(e.to_string()))?;
        debug!(batch, status = status.as_u16(), bytes = body.len(), "batch response");
        if !status.is_success() {
            return Err(EndpointError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        decode_reply(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::net::TcpListener;

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    #[test]
    fn log_lines_read_naturally() {
        let mut entry = BatchLogEntry {
            set: "Millennium Falcon".into(),
            set_number: "75192".into(),
            matched: Some(4),
            error: None,
            ebay_total: Some(37),
        };
        assert_eq!(format_log_entry(&entry), "Millennium Falcon (75192): 4 matched of 37");
        entry.error = Some("ebay timed out".into());
        assert_eq!(format_log_entry(&entry), "Millennium Falcon (75192): error: ebay timed out");
    }

    #[test]
    fn tolerant_decoding() {
        assert_eq!(decode_reply(r#"{"done":true}"#).unwrap(), BatchReply::Done);
        let BatchReply::Progress(p) = decode_reply(r#"{"pricesSaved":3,"isLastBatch":true}"#).unwrap() else {
            panic!("expected progress");
        };
        assert_eq!(p.saved, 3);
        assert_eq!(p.updated, 0);
        assert!(p.is_last_batch);
        assert!(matches!(decode_reply("<html>"), Err(EndpointError::Malformed(_))));

        let BatchReply::Progress(p) =
            decode_reply(r#"{"pricesSaved":1,"isLastBatch":false,"partial":true,"processedThrough":4}"#)
                .unwrap()
        else {
            panic!("expected progress");
        };
        assert!(p.partial);
        assert_eq!(p.processed_through, 4);
    }

    #[test]
    fn error_body_is_not_progress() {
        match decode_reply(r#"{"error":"Missing SUPABASE credentials"}"#) {
            Err(EndpointError::Malformed(msg)) => assert!(msg.contains("Missing SUPABASE credentials")),
            other => panic!("unexpected reply: {other:?}"),
        }
        match decode_reply(r#"{"error":"store unavailable","detail":"pool timed out","done":true}"#) {
            Err(EndpointError::Malformed(msg)) => assert!(msg.contains("store unavailable: pool timed out")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn posts_batch_with_bearer_token() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path(PRICE_UPDATE_PATH)
                .header("Authorization", "Bearer s3cret")
                .json_body(json!({ "batch": 4, "batchSize": 10, "skip": 0 }));
            then.status(200).json_body(json!({
                "pricesSaved": 12,
                "setsUpdated": 3,
                "totalSetsWithNumbers": 95,
                "isLastBatch": false,
                "log": [{ "set": "Falcon", "setNumber": "75192", "matched": 5 }]
            }));
        });
        let endpoint =
            HttpBatchEndpoint::new(&server.base_url(), Some("s3cret".into()), Duration::from_secs(5))
                .unwrap();
        let reply = endpoint.run_batch(4, 10, 0).await.unwrap();
        mock.assert();
        assert_eq!(
            reply,
            BatchReply::Progress(BatchProgress {
                saved: 12,
                updated: 3,
                total_items: Some(95),
                is_last_batch: false,
                partial: false,
                processed_through: 0,
                log: vec!["Falcon (75192): 5 matched".into()],
            })
        );
    }

    #[tokio::test]
    async fn server_error_carries_detail() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(PRICE_UPDATE_PATH);
            then.status(503)
                .json_body(json!({ "error": "store unavailable", "detail": "pool timed out" }));
        });
        let endpoint = HttpBatchEndpoint::new(&server.base_url(), None, Duration::from_secs(5)).unwrap();
        let err = endpoint.run_batch(0, 10, 0).await.unwrap_err();
        match err {
            EndpointError::Status { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "store unavailable: pool timed out");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
