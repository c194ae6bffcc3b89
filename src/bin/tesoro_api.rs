// HTTP API server for the TesoroTrack batch jobs

use anyhow::{Context, Result};
use std::sync::Arc;
use tesoro_track::api::ApiServer;
use tesoro_track::logging::init_tracing;
use tesoro_track::store::PgCatalogStore;
use tesoro_track::util::db::Db;
use tesoro_track::util::env::redact_dsn;
use tesoro_track::{AppConfig, JobContext};

#[actix_web::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing("info,sqlx=warn")?;

    tracing::info!("Initializing TesoroTrack API server");

    let server = ApiServer::from_config(&config)?;

    let database_url = config.require_database_url()?;
    tracing::info!(url = %redact_dsn(database_url), "connecting to catalog database");
    let db = Db::connect(database_url, config.db_max_conns)
        .await
        .context("Db::connect failed")?;
    tracing::info!("Database connected successfully");

    let ctx = JobContext::from_config(&config, Arc::new(PgCatalogStore::new(db)))?;
    server.run(ctx).await
}
