//! Server-side batch jobs. Each call is short, stateless and bounded by a
//! wall-clock budget; the caller owns the cursor (batch index or offset).

pub mod aggregate;
pub mod enrich;
pub mod import;
pub mod price_update;
pub mod theme_images;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregate::TrimPolicy;
use crate::config::AppConfig;
use crate::model::CatalogItem;
use crate::sources::{
    BricksetAdapter, EbayAdapter, RebrickableAdapter, SourceAdapter, SourceError, ThemeDirectory,
    WikiImageAdapter,
};
use crate::store::{CatalogStore, StoreError};

pub use aggregate::{run_aggregate, AggregateRequest};
pub use enrich::{run_enrich, EnrichRequest};
pub use import::{run_import, ImportRequest};
pub use price_update::{
    run_price_batch, BatchLogEntry, PriceBatchOutcome, PriceBatchReport, PriceBatchRequest,
};
pub use theme_images::{run_theme_images, ThemeImagesRequest};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl JobError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, JobError::InvalidRequest(_))
    }
}

/// Store failures that mean the whole batch cannot make progress. Anything
/// else is scoped to the record that triggered it.
pub(crate) fn is_fatal_store_error(err: &StoreError) -> bool {
    matches!(err, StoreError::Unavailable(_))
}

/// Everything a job needs, shared by the HTTP handlers and the in-process
/// endpoint.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn CatalogStore>,
    pub listings: Arc<dyn SourceAdapter>,
    pub catalog: Arc<dyn SourceAdapter>,
    pub themes: Arc<dyn ThemeDirectory>,
    pub set_details: Arc<dyn SourceAdapter>,
    pub images: Arc<dyn SourceAdapter>,
    pub time_budget: Duration,
    pub import_themes: Vec<String>,
    pub trim: TrimPolicy,
}

impl JobContext {
    pub fn from_config(config: &AppConfig, store: Arc<dyn CatalogStore>) -> anyhow::Result<Self> {
        let timeout = config.http_timeout_secs;
        let ebay = EbayAdapter::new(config.ebay_base_url.as_deref(), timeout)?
            .with_app_id(config.ebay_app_id.clone());
        let rebrickable = Arc::new(
            RebrickableAdapter::new(config.rebrickable_base_url.as_deref(), timeout)?
                .with_api_key(config.rebrickable_api_key.clone()),
        );
        let brickset = BricksetAdapter::new(config.brickset_base_url.as_deref(), timeout)?
            .with_api_key(config.brickset_api_key.clone());
        let wiki = WikiImageAdapter::new(config.wiki_api_url.as_deref(), timeout)?;

        Ok(Self {
            store,
            listings: Arc::new(ebay),
            catalog: rebrickable.clone(),
            themes: rebrickable,
            set_details: Arc::new(brickset),
            images: Arc::new(wiki),
            time_budget: config.batch_time_budget,
            import_themes: config.import_themes.clone(),
            trim: TrimPolicy::default(),
        })
    }

    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.time_budget)
    }
}

/// Wall-clock ceiling for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Where the caller should continue, when there is more to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextBatch {
    Theme { theme: String },
    Offset { offset: u64 },
}

/// Result shape shared by the import, enrichment, image and aggregate jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub success: bool,
    pub dry_run: bool,
    pub processed: u64,
    pub updated: u64,
    pub not_found: u64,
    pub log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<NextBatch>,
}

impl JobReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            ..Default::default()
        }
    }

    pub fn line(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    /// Out of time: log `rest` as untouched and point the caller at the
    /// first of them.
    pub(crate) fn cut_short(&mut self, rest: &[CatalogItem], resume_at: u64) {
        for item in rest {
            let label = item.set_number.as_deref().unwrap_or(&item.name);
            self.line(format!("{label}: time budget exhausted; not processed"));
        }
        tracing::info!(left = rest.len(), resume_at, "time budget exhausted");
        self.next_batch = Some(NextBatch::Offset { offset: resume_at });
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Scripted adapters for job and driver tests.

    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::JobContext;
    use crate::aggregate::TrimPolicy;
    use crate::sources::{
        Cursor, Page, ProviderTheme, RawExternalRecord, SourceAdapter, SourceError,
        ThemeDirectory, UnitOfWork,
    };
    use crate::store::CatalogStore;

    /// One page per unit, keyed by the unit's display label.
    #[derive(Default)]
    pub struct ScriptedAdapter {
        pub records: HashMap<String, Vec<RawExternalRecord>>,
        pub failing: HashSet<String>,
        pub not_configured: bool,
        pub calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        pub fn with(mut self, unit: &str, records: Vec<RawExternalRecord>) -> Self {
            self.records.insert(unit.to_string(), records);
            self
        }

        pub fn failing(mut self, unit: &str) -> Self {
            self.failing.insert(unit.to_string());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        fn page_delay(&self) -> Duration {
            Duration::ZERO
        }

        async fn fetch_page(
            &self,
            unit: &UnitOfWork,
            _cursor: &Cursor,
        ) -> Result<Page<RawExternalRecord>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.not_configured {
                return Err(SourceError::NotConfigured {
                    provider: "scripted",
                    missing: "SCRIPTED_KEY",
                });
            }
            let label = unit.to_string();
            if self.failing.contains(&label) {
                return Err(SourceError::Timeout {
                    provider: "scripted",
                    unit: label,
                });
            }
            let records = self.records.get(&label).cloned().unwrap_or_default();
            let total = Some(records.len() as u64);
            Ok(Page::last(records, total))
        }
    }

    #[derive(Default)]
    pub struct StaticThemes(pub Vec<ProviderTheme>);

    #[async_trait]
    impl ThemeDirectory for StaticThemes {
        async fn themes(&self) -> Result<Vec<ProviderTheme>, SourceError> {
            Ok(self.0.clone())
        }
    }

    pub fn context(store: Arc<dyn CatalogStore>) -> JobContext {
        JobContext {
            store,
            listings: Arc::new(ScriptedAdapter::default()),
            catalog: Arc::new(ScriptedAdapter::default()),
            themes: Arc::new(StaticThemes::default()),
            set_details: Arc::new(ScriptedAdapter::default()),
            images: Arc::new(ScriptedAdapter::default()),
            time_budget: Duration::from_secs(50),
            import_themes: vec!["Star Wars".into(), "Harry Potter".into(), "Technic".into()],
            trim: TrimPolicy::default(),
        }
    }
}
