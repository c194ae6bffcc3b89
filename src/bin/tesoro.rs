use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tesoro_track::api::ApiServer;
use tesoro_track::driver::{
    progress_label, BatchEndpoint, CheckpointStore, DriverOptions, FileCheckpointStore,
    HttpBatchEndpoint, InProcessEndpoint, JobState, LogSink, Orchestrator, PRICE_UPDATE_JOB,
};
use tesoro_track::jobs::{
    run_aggregate, run_enrich, run_import, run_theme_images, AggregateRequest, EnrichRequest,
    ImportRequest, JobReport, NextBatch, ThemeImagesRequest,
};
use tesoro_track::logging::init_tracing;
use tesoro_track::model::Category;
use tesoro_track::store::PgCatalogStore;
use tesoro_track::util::db::Db;
use tesoro_track::util::env::redact_dsn;
use tesoro_track::{AppConfig, JobContext};

#[derive(Parser, Debug)]
#[command(name = "tesoro", version, about = "TesoroTrack sync operator CLI")]
struct Cli {
    #[command(flatten)]
    driver: DriverArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct DriverArgs {
    /// Base URL of the API server that runs price batches
    #[arg(long, global = true, env = "TESORO_ENDPOINT")]
    endpoint: Option<String>,
    /// Bearer secret for the API server
    #[arg(long, global = true, env = "API_SECRET", hide_env_values = true)]
    secret: Option<String>,
    /// Directory holding checkpoint files
    #[arg(long, global = true, env = "TESORO_STATE_DIR", default_value = ".tesoro")]
    state_dir: PathBuf,
    #[arg(long, global = true, env = "TESORO_BATCH_SIZE", default_value_t = 10)]
    batch_size: u32,
    /// Pause between batches
    #[arg(long, global = true, env = "TESORO_DELAY_MS", default_value_t = 500)]
    delay_ms: u64,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run the price batch job, resuming an interrupted run when one exists
    Run {
        /// Ignore any checkpoint and start from batch 0
        #[arg(long, default_value_t = false)]
        fresh: bool,
        /// Run batches in this process instead of calling --endpoint
        #[arg(long, default_value_t = false)]
        local: bool,
    },
    /// Inspect or drop the stored checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Import a theme's sets from the parts catalog
    Import {
        #[arg(long)]
        theme: String,
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Keep going through the configured theme list
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Backfill retail price, pieces, retirement and images
    Enrich {
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Keep requesting the next offset until the catalog is exhausted
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Assign wiki images to a theme's items
    ThemeImages {
        #[arg(long)]
        theme: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Recompute derived prices
    Aggregate {
        #[arg(long, value_delimiter = ',')]
        item_ids: Option<Vec<i64>>,
    },
    /// Start the API server
    Serve,
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    Show,
    Clear,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CategoryArg {
    Lego,
    MegaConstrux,
    FunkoPop,
}

impl From<CategoryArg> for Category {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Lego => Category::Lego,
            CategoryArg::MegaConstrux => Category::MegaConstrux,
            CategoryArg::FunkoPop => Category::FunkoPop,
        }
    }
}

struct StdoutSink;

impl LogSink for StdoutSink {
    fn append(&self, line: &str) {
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { fresh, local } => run_prices(&config, &cli.driver, fresh, local).await,
        Commands::Checkpoint { action } => {
            let store = FileCheckpointStore::new(&cli.driver.state_dir);
            match action {
                CheckpointAction::Show => match store.load_raw(PRICE_UPDATE_JOB).await {
                    Some(cp) => {
                        let usable = if cp.is_usable(Utc::now()) { "resumable" } else { "expired" };
                        let within = if cp.item_offset > 0 {
                            format!(" item {}", cp.item_offset)
                        } else {
                            String::new()
                        };
                        println!(
                            "{} at {}{within} ({} saved, {} updated), saved {} [{usable}]",
                            cp.job,
                            progress_label(cp.batch, cp.total_batches),
                            cp.total_saved,
                            cp.total_updated,
                            cp.saved_at.to_rfc3339()
                        );
                    }
                    None => println!("no checkpoint in {}", store.dir().display()),
                },
                CheckpointAction::Clear => {
                    store.clear(PRICE_UPDATE_JOB).await?;
                    println!("checkpoint cleared");
                }
            }
            Ok(())
        }
        Commands::Import {
            theme,
            category,
            dry_run,
            follow,
        } => {
            let ctx = local_context(&config).await?;
            let mut next = Some(theme);
            while let Some(theme) = next.take() {
                let req = ImportRequest {
                    theme,
                    category: category.map(Into::into),
                    dry_run,
                };
                let report = run_import(&ctx, &req).await?;
                print_report(&report);
                if follow {
                    if let Some(NextBatch::Theme { theme }) = report.next_batch {
                        next = Some(theme);
                    }
                }
            }
            Ok(())
        }
        Commands::Enrich {
            offset,
            limit,
            category,
            dry_run,
            follow,
        } => {
            let ctx = local_context(&config).await?;
            let mut offset = Some(offset);
            while let Some(current) = offset.take() {
                let req = EnrichRequest {
                    offset: current,
                    limit,
                    category: category.map(Into::into),
                    dry_run,
                };
                let report = run_enrich(&ctx, &req, Utc::now()).await?;
                print_report(&report);
                if follow {
                    if let Some(NextBatch::Offset { offset: next }) = report.next_batch {
                        offset = Some(next);
                    }
                }
            }
            Ok(())
        }
        Commands::ThemeImages { theme, dry_run } => {
            let ctx = local_context(&config).await?;
            let req = ThemeImagesRequest {
                theme,
                category: None,
                offset: 0,
                limit: None,
                dry_run,
            };
            print_report(&run_theme_images(&ctx, &req).await?);
            Ok(())
        }
        Commands::Aggregate { item_ids } => {
            let ctx = local_context(&config).await?;
            let req = AggregateRequest {
                item_ids,
                ..Default::default()
            };
            print_report(&run_aggregate(&ctx, &req, Utc::now()).await?);
            Ok(())
        }
        Commands::Serve => {
            let server = ApiServer::from_config(&config)?;
            let ctx = local_context(&config).await?;
            server.run(ctx).await
        }
    }
}

async fn local_context(config: &AppConfig) -> Result<JobContext> {
    let database_url = config.require_database_url()?;
    info!(url = %redact_dsn(database_url), "connecting to catalog database");
    let db = Db::connect(database_url, config.db_max_conns)
        .await
        .context("Db::connect failed")?;
    JobContext::from_config(config, Arc::new(PgCatalogStore::new(db)))
}

async fn run_prices(config: &AppConfig, args: &DriverArgs, fresh: bool, local: bool) -> Result<()> {
    let endpoint: Arc<dyn BatchEndpoint> = if local {
        Arc::new(InProcessEndpoint::new(local_context(config).await?))
    } else {
        let Some(base) = args.endpoint.as_deref() else {
            bail!("--endpoint (or TESORO_ENDPOINT) is required unless --local is set");
        };
        Arc::new(HttpBatchEndpoint::new(
            base,
            args.secret.clone(),
            Duration::from_secs(60),
        )?)
    };
    let options = DriverOptions {
        job: PRICE_UPDATE_JOB.to_string(),
        batch_size: args.batch_size,
        delay: Duration::from_millis(args.delay_ms),
    };
    let checkpoints = Arc::new(FileCheckpointStore::new(&args.state_dir));
    let mut orchestrator =
        Orchestrator::new(endpoint, checkpoints, options).with_sink(Arc::new(StdoutSink));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current batch");
            on_signal.cancel();
        }
    });

    let state = if fresh {
        orchestrator.start(&cancel).await
    } else if orchestrator.recover().await.is_resumable() {
        orchestrator.resume(&cancel).await
    } else {
        orchestrator.start(&cancel).await
    };

    println!("{}", state.label());
    if let JobState::Stopped { .. } = state {
        println!("run `tesoro run` again to resume");
    }
    Ok(())
}

fn print_report(report: &JobReport) {
    for line in &report.log {
        println!("{line}");
    }
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    println!(
        "{prefix}processed {}, updated {}, not found {}",
        report.processed, report.updated, report.not_found
    );
    match &report.next_batch {
        Some(NextBatch::Theme { theme }) => println!("next theme: {theme}"),
        Some(NextBatch::Offset { offset }) => println!("next offset: {offset}"),
        None => {}
    }
}
