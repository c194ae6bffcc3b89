// HTTP request handlers for the job routes

use actix_web::{http::StatusCode, web, HttpResponse, Result};
use chrono::Utc;
use serde::Deserialize;
use std::time::Instant;

use crate::api::models::{ApiResponse, ErrorBody, HealthResponse};
use crate::jobs::{
    run_aggregate, run_enrich, run_import, run_price_batch, run_theme_images, AggregateRequest,
    EnrichRequest, ImportRequest, JobContext, JobError, PriceBatchRequest, ThemeImagesRequest,
};
use crate::sources::SourceError;
use crate::store::StoreError;

/// Shared state behind every handler.
pub struct AppState {
    pub ctx: JobContext,
    pub started: Instant,
}

impl AppState {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            ctx,
            started: Instant::now(),
        }
    }
}

fn status_for(err: &JobError) -> StatusCode {
    match err {
        JobError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        JobError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        JobError::Source(SourceError::NotConfigured { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_label(err: &JobError) -> &'static str {
    match err {
        JobError::InvalidRequest(_) => "invalid request",
        JobError::Store(StoreError::Unavailable(_)) => "store unavailable",
        JobError::Store(_) => "store error",
        JobError::Source(SourceError::NotConfigured { .. }) => "provider not configured",
        JobError::Source(_) => "provider error",
    }
}

pub fn error_response(err: &JobError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::error!(error = %err, "job failed");
    } else {
        tracing::debug!(error = %err, "job request rejected");
    }
    HttpResponse::build(status).json(ErrorBody::new(error_label(err), Some(err.to_string())))
}

/// Liveness plus store reachability. Always 200 while the process is up.
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let (status, database) = match state.ctx.store.ping().await {
        Ok(()) => ("healthy", "connected"),
        Err(e) => {
            tracing::warn!(error = %e, "health check: store unreachable");
            ("degraded", "disconnected")
        }
    };

    let response = ApiResponse::success(HealthResponse {
        status: status.to_string(),
        database: database.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
    });

    Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBatchQuery {
    pub batch: Option<u32>,
    pub batch_size: Option<u32>,
    pub skip: Option<u32>,
}

impl PriceBatchQuery {
    fn into_request(self) -> PriceBatchRequest {
        let defaults = PriceBatchRequest::default();
        PriceBatchRequest {
            batch: self.batch.unwrap_or(defaults.batch),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            skip: self.skip.unwrap_or(defaults.skip),
        }
    }
}

/// One price batch. A non-empty body must be a JSON request and wins over
/// the query string.
pub async fn price_update(
    state: web::Data<AppState>,
    query: web::Query<PriceBatchQuery>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        query.into_inner().into_request()
    } else {
        match serde_json::from_slice::<PriceBatchRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return Ok(error_response(&JobError::InvalidRequest(format!(
                    "request body is not a price batch request: {e}"
                ))))
            }
        }
    };
    tracing::info!(
        batch = req.batch,
        batch_size = req.batch_size,
        skip = req.skip,
        "price batch requested"
    );

    match run_price_batch(&state.ctx, req, Utc::now()).await {
        Ok(outcome) => Ok(HttpResponse::Ok().json(outcome)),
        Err(e) => Ok(error_response(&e)),
    }
}

pub async fn import_theme(
    state: web::Data<AppState>,
    payload: web::Json<ImportRequest>,
) -> Result<HttpResponse> {
    tracing::info!(theme = %payload.theme, dry_run = payload.dry_run, "theme import requested");
    match run_import(&state.ctx, &payload).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => Ok(error_response(&e)),
    }
}

pub async fn enrich(
    state: web::Data<AppState>,
    payload: web::Json<EnrichRequest>,
) -> Result<HttpResponse> {
    tracing::info!(offset = payload.offset, dry_run = payload.dry_run, "enrichment requested");
    match run_enrich(&state.ctx, &payload, Utc::now()).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => Ok(error_response(&e)),
    }
}

pub async fn theme_images(
    state: web::Data<AppState>,
    payload: web::Json<ThemeImagesRequest>,
) -> Result<HttpResponse> {
    tracing::info!(theme = %payload.theme, dry_run = payload.dry_run, "theme images requested");
    match run_theme_images(&state.ctx, &payload).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => Ok(error_response(&e)),
    }
}

pub async fn aggregate(
    state: web::Data<AppState>,
    payload: Option<web::Json<AggregateRequest>>,
) -> Result<HttpResponse> {
    let req = payload.map(|p| p.into_inner()).unwrap_or_default();
    match run_aggregate(&state.ctx, &req, Utc::now()).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => Ok(error_response(&e)),
    }
}
