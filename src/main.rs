use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commission_archiver::archiver::{BatchDriver, CrawlSettings, ResourceArchiver};
use commission_archiver::config::Config;
use commission_archiver::extractors::ExtractorRegistry;
use commission_archiver::http::HttpClient;
use commission_archiver::manifest::{format_size, ManifestStore};
use commission_archiver::repack::Repacker;
use commission_archiver::source::{PostStream, SkebClient, UserSort, WorkRole};
use commission_archiver::store::{open_backend, Repository};

#[derive(Parser, Debug)]
#[command(
    name = "commission-archiver",
    version,
    about = "Archive files linked from commission posts into zip packs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the newest art posts
    Newest {
        /// Number of posts to process
        #[arg(short = 'n', long, default_value_t = 200)]
        limit: usize,
    },
    /// Crawl the posts of every user in the directory
    Users {
        #[arg(long, value_enum, default_value_t = UserSort::Popularity)]
        sort: UserSort,
        #[arg(long, value_enum, default_value_t = WorkRole::Client)]
        role: WorkRole,
        /// Number of posts to process; unlimited when omitted
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Fold unarchived bundles into a new pack
    Pack {
        /// Upper bound for the new pack, in bytes
        #[arg(long)]
        max_size: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        repository = %config.repository,
        backend = ?config.storage_backend,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .context("Failed to create work directory")?;

    let store = open_backend(&config).await?;
    let repo = Repository::new(store, config.repository.clone());
    repo.ensure()
        .await
        .with_context(|| format!("Failed to open repository {}", config.repository))?;
    let manifest = Arc::new(ManifestStore::new(repo));

    match cli.command {
        Command::Newest { limit } => {
            let client = Arc::new(source_client(&config)?);
            let driver = crawl_driver(&config, &manifest, &client)?;
            crawl(&driver, client.art_posts(), Some(limit)).await;
        }
        Command::Users { sort, role, limit } => {
            let client = Arc::new(source_client(&config)?);
            let driver = crawl_driver(&config, &manifest, &client)?;
            crawl(&driver, client.users_posts(sort, role), limit).await;
        }
        Command::Pack { max_size } => {
            let max_size = max_size.unwrap_or(config.repack_max_size);
            let repacker = Repacker::from_config(&config, Arc::clone(&manifest));
            match repacker.repack_all(max_size).await? {
                Some(record) => info!(
                    filename = %record.filename,
                    size = %format_size(record.size),
                    "Created pack"
                ),
                None => info!("No pack created"),
            }
        }
    }

    Ok(())
}

fn source_client(config: &Config) -> Result<SkebClient> {
    let http = HttpClient::from_config(config)?;
    SkebClient::from_config(config, http)
}

fn crawl_driver(config: &Config, manifest: &Arc<ManifestStore>, client: &Arc<SkebClient>) -> Result<BatchDriver> {
    let http = HttpClient::from_config(config)?;
    let registry = ExtractorRegistry::with_default_sites(&http, config.drive_wait);
    info!(sites = ?registry.site_ids(), "Extractors registered");

    let archiver = ResourceArchiver::new(Arc::clone(manifest), Arc::new(registry), config.work_dir.clone());
    let source = Arc::clone(client);
    Ok(BatchDriver::new(archiver, source, CrawlSettings::from_config(config)))
}

/// Run a crawl until it finishes or a shutdown signal arrives.
///
/// Every write is atomic, so stopping between items loses nothing.
async fn crawl(driver: &BatchDriver, posts: PostStream<'_>, limit: Option<usize>) {
    tokio::select! {
        _ = driver.run(posts, limit) => {},
        () = shutdown_signal() => warn!("Shutdown requested, stopping crawl"),
    }
}

fn init_tracing() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,commission_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
