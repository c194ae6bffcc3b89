//! Process configuration gathered from the environment (after `.env`).

use anyhow::{Context, Result};
use std::time::Duration;

use crate::util::env::{db_url, env_list, env_opt, env_parse, env_parse_opt, init_env};

/// Themes imported in order when no list is configured.
pub const DEFAULT_IMPORT_THEMES: &[&str] = &[
    "Star Wars",
    "Harry Potter",
    "Marvel Super Heroes",
    "Technic",
    "Icons",
    "Ideas",
    "Ninjago",
    "City",
];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub db_max_conns: u32,
    pub api_host: String,
    pub api_port: u16,
    pub api_secret: Option<String>,
    pub allowed_origins: String,
    pub ebay_app_id: Option<String>,
    pub ebay_base_url: Option<String>,
    pub rebrickable_api_key: Option<String>,
    pub rebrickable_base_url: Option<String>,
    pub brickset_api_key: Option<String>,
    pub brickset_base_url: Option<String>,
    pub wiki_api_url: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub batch_time_budget: Duration,
    pub import_themes: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        init_env();

        let api_port = match env_opt("API_PORT") {
            Some(raw) => raw.trim().parse().context("Invalid API_PORT")?,
            None => 8080,
        };
        let mut import_themes = env_list("IMPORT_THEMES");
        if import_themes.is_empty() {
            import_themes = DEFAULT_IMPORT_THEMES.iter().map(|s| s.to_string()).collect();
        }

        Ok(Self {
            database_url: db_url().ok(),
            db_max_conns: env_parse("DB_MAX_CONNS", 5u32),
            api_host: env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port,
            api_secret: env_opt("API_SECRET"),
            allowed_origins: env_opt("ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            ebay_app_id: env_opt("EBAY_APP_ID"),
            ebay_base_url: env_opt("EBAY_BASE_URL"),
            rebrickable_api_key: env_opt("REBRICKABLE_API_KEY"),
            rebrickable_base_url: env_opt("REBRICKABLE_BASE_URL"),
            brickset_api_key: env_opt("BRICKSET_API_KEY"),
            brickset_base_url: env_opt("BRICKSET_BASE_URL"),
            wiki_api_url: env_opt("WIKI_API_URL"),
            http_timeout_secs: env_parse_opt("HTTP_TIMEOUT_SECS"),
            batch_time_budget: Duration::from_secs(env_parse("BATCH_TIME_BUDGET_SECS", 50u64)),
            import_themes,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL (or SUPABASE_DB_URL) is required")
    }

    pub fn require_api_secret(&self) -> Result<&str> {
        self.api_secret
            .as_deref()
            .context("API_SECRET environment variable is required")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_conns: 5,
            api_host: "127.0.0.1".into(),
            api_port: 8080,
            api_secret: None,
            allowed_origins: "http://localhost:3000".into(),
            ebay_app_id: None,
            ebay_base_url: None,
            rebrickable_api_key: None,
            rebrickable_base_url: None,
            brickset_api_key: None,
            brickset_base_url: None,
            wiki_api_url: None,
            http_timeout_secs: None,
            batch_time_budget: Duration::from_secs(50),
            import_themes: DEFAULT_IMPORT_THEMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}
