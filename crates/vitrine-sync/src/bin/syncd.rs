//! vitrine-syncd: headless sync daemon and one-shot sync commands.
//!
//! Wires the SQLite local store, the PostgreSQL metadata store and either
//! HTTP or filesystem object storage, then runs one engine operation (or the
//! polling loop for `watch`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vitrine_core::logging::SUBSYSTEM_DAEMON;
use vitrine_core::{BinaryRef, Image, NewCategory, ObjectStorage, Session};
use vitrine_remote::{FilesystemObjectStorage, HttpObjectStorage, PgMetadataStore};
use vitrine_store::BackendChain;
use vitrine_sync::{Collaborators, ImageOptimizer, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "vitrine-syncd")]
#[command(author, version, about = "Offline-first gallery sync for vitrine")]
#[command(propagate_version = true)]
struct Cli {
    /// Local data directory (default: $VITRINE_DATA_DIR or ./vitrine-data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Apply remote schema migrations before running
    #[arg(long, global = true)]
    migrate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile with the remote store, then retry unfinished uploads
    Sync,

    /// Link local-only categories and images to remote rows
    Hydrate,

    /// Re-run uploads that are pending, failed, or missing their record
    Retry,

    /// Add image files to a category (created if missing) and upload them
    Upload {
        /// Category name
        category: String,

        /// Image files
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },

    /// Sync once, then hydrate and retry on every interval until Ctrl-C
    Watch {
        /// Polling interval in seconds (default: $VITRINE_SYNC_INTERVAL_SECS or 300)
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "vitrine_syncd=info,vitrine_sync=info,vitrine_store=info,vitrine_remote=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("vitrine-syncd.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        subsystem = SUBSYSTEM_DAEMON,
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}

async fn object_storage() -> anyhow::Result<Arc<dyn ObjectStorage>> {
    if let Ok(url) = std::env::var("VITRINE_STORAGE_URL") {
        let public = std::env::var("VITRINE_STORAGE_PUBLIC_URL").unwrap_or_else(|_| url.clone());
        return Ok(Arc::new(HttpObjectStorage::new(url, public)?));
    }
    if let Ok(dir) = std::env::var("VITRINE_STORAGE_DIR") {
        let mut storage = FilesystemObjectStorage::new(dir);
        if let Ok(public) = std::env::var("VITRINE_STORAGE_PUBLIC_URL") {
            storage = storage.with_public_base_url(public);
        }
        if let Err(e) = storage.validate().await {
            bail!("object storage directory is not usable: {}", e);
        }
        return Ok(Arc::new(storage));
    }
    bail!("set VITRINE_STORAGE_URL or VITRINE_STORAGE_DIR")
}

async fn open_engine(cli: &Cli, config: SyncConfig) -> anyhow::Result<SyncEngine> {
    let session = Session::new(
        required_env("VITRINE_USER_ID")?,
        required_env("VITRINE_AUTH_TOKEN")?,
    )?;

    let pool = config.remote_pool().with_env_overrides();
    let metadata =
        PgMetadataStore::connect_with(&required_env("DATABASE_URL")?, &pool).await?;
    if cli.migrate {
        metadata.migrate().await?;
        info!(subsystem = SUBSYSTEM_DAEMON, "Remote schema migrations applied");
    }

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| std::env::var("VITRINE_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("vitrine-data"));
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("cannot create {}", data_dir.display()))?;

    let opened = BackendChain::for_data_dir("vitrine", &data_dir).open().await;
    if let Some(report) = &opened.migration {
        info!(
            subsystem = SUBSYSTEM_DAEMON,
            copied = report.copied,
            skipped = report.skipped,
            "Local store migration finished"
        );
    }

    let collaborators = Collaborators {
        remote: Arc::new(metadata),
        storage: object_storage().await?,
        optimizer: Arc::new(ImageOptimizer),
    };
    Ok(SyncEngine::open(session, opened.store, collaborators, config).await?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_images(files: &[PathBuf]) -> anyhow::Result<Vec<Image>> {
    let mut images = Vec::with_capacity(files.len());
    for file in files {
        let path = tokio::fs::canonicalize(file)
            .await
            .with_context(|| format!("cannot read {}", file.display()))?;
        let size = tokio::fs::metadata(&path).await?.len();
        let pose = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image")
            .to_string();
        let mut image = Image::new(BinaryRef::File { path }, pose);
        image.size_bytes = size;
        images.push(image);
    }
    Ok(images)
}

async fn watch(engine: &SyncEngine, interval: Duration) -> anyhow::Result<()> {
    match engine.sync_on_load().await {
        Ok(report) => print_json(&report)?,
        Err(e) => warn!(subsystem = SUBSYSTEM_DAEMON, error = %e, "Initial sync failed"),
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    info!(
        subsystem = SUBSYSTEM_DAEMON,
        interval_secs = interval.as_secs(),
        "Watching for changes"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sweep = engine.retry_pending().await;
                info!(
                    subsystem = SUBSYSTEM_DAEMON,
                    categories_pushed = sweep.categories.len(),
                    uploaded = sweep.uploads.uploaded(),
                    failed = sweep.uploads.failed(),
                    "Sweep finished"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!(subsystem = SUBSYSTEM_DAEMON, "Shutdown requested");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Commands::Watch {
        interval: Some(secs),
    } = &cli.command
    {
        config = config.with_sync_interval(Duration::from_secs(*secs));
    }
    let interval = config.sync_interval;

    let engine = open_engine(&cli, config).await?;

    let outcome = match &cli.command {
        Commands::Sync => match engine.sync_on_load().await {
            Ok(report) => print_json(&report),
            Err(e) => Err(e.into()),
        },
        Commands::Hydrate => match engine.hydrate_identifiers().await {
            Ok(report) => print_json(&report),
            Err(e) => Err(e.into()),
        },
        Commands::Retry => print_json(&engine.retry_pending().await),
        Commands::Upload { category, files } => {
            let images = load_images(files).await?;
            let existing = engine
                .snapshot()
                .categories
                .iter()
                .find(|c| &c.name == category)
                .map(|c| c.local_id);
            let local_id = match existing {
                Some(id) => id,
                None => {
                    engine
                        .add_category(NewCategory::new(category.clone()))
                        .await
                        .local_id
                }
            };
            match engine.add_images(local_id, images).await {
                Some(report) => print_json(&report),
                None => Err(anyhow::anyhow!("category {} disappeared", category)),
            }
        }
        Commands::Watch { .. } => watch(&engine, interval).await,
    };

    engine.close().await?;
    outcome
}
