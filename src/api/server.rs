// API server implementation using actix-web

use crate::api::{auth, handlers::AppState, middleware, routes};
use crate::config::AppConfig;
use crate::jobs::JobContext;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub api_secret: String,
    pub allowed_origins: String,
}

impl ApiServer {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            host: config.api_host.clone(),
            port: config.api_port,
            api_secret: config.require_api_secret()?.to_string(),
            allowed_origins: config.allowed_origins.clone(),
        })
    }

    /// Serve until the process receives a shutdown signal.
    pub async fn run(self, ctx: JobContext) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        tracing::info!(
            host = %self.host,
            port = %self.port,
            "Starting TesoroTrack API server"
        );

        let state = web::Data::new(AppState::new(ctx));
        let api_secret = self.api_secret.clone();
        let allowed_origins = self.allowed_origins.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);
            let auth = auth::Auth::new(api_secret.clone());

            App::new()
                .app_data(state.clone())
                .app_data(web::JsonConfig::default().limit(64 * 1024))
                .wrap(auth)
                .wrap(cors)
                .wrap(compress)
                .wrap(logger)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
