//! # Capture Harness CLI (`cap`)
//!
//! The `cap` binary runs the capture pipeline daemon and offers one-shot
//! commands for each stage.
//!
//! ## Usage
//!
//! ```bash
//! cap --config ./config/cap.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cap init` | Create the SQLite database and staging directories |
//! | `cap serve` | Run the HTTP server, ingestor, uploader, and event consumer |
//! | `cap clean <file>` | Clean and chunk an HTML file, print the document |
//! | `cap analyze <processed.json>` | Run the analysis client on one artifact |
//! | `cap upload` | Upload everything in the prompt store once |
//! | `cap events poll` | Print the oldest batch of direct-delivered events |
//! | `cap history --user <id>` | List a user's projects |
//! | `cap sessions` | List capture sessions |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! cap init --config ./config/cap.toml
//!
//! # Preview what an upload would do
//! cap upload --dry-run
//!
//! # Run everything
//! RUST_LOG=capture_harness=debug cap serve
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use capture_harness::analysis::{AnalysisClient, Analyzer};
use capture_harness::blob_store::{BlobStore, SqliteBlobStore};
use capture_harness::capture::{self, CaptureService, SessionManager};
use capture_harness::config::{self, Config};
use capture_harness::events::{self, EventPublisher, FallbackConsumer, StreamConsumer, Transport};
use capture_harness::ingestor::{self, ArtifactKey, Ingestor};
use capture_harness::server::{self, AppState};
use capture_harness::sqlite_store::{SqliteEventStore, SqliteProjectStore};
use capture_harness::uploader::Uploader;
use capture_harness::{db, migrate};
use capture_harness_core::chunk::chunk_html_with_limit;
use capture_harness_core::models::CaptureMetadata;
use capture_harness_core::store::{EventStore, ProjectStore};

/// Capture Harness CLI: clean, analyze, and store webpage captures.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cap.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cap",
    about = "Capture Harness: a capture-to-storage ingestion pipeline for webpage snapshots",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cap.toml`. When the file does not exist,
    /// defaults rooted at `./data` are used.
    #[arg(long, global = true, default_value = "./config/cap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and staging directories.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Run every pipeline stage until interrupted.
    ///
    /// A stage whose dependency is unavailable (database, API key, broker)
    /// is disabled with a warning; the others keep running.
    Serve,

    /// Clean and chunk an HTML file and print the structural document.
    Clean {
        /// Path to the HTML file.
        file: PathBuf,

        /// Page URL recorded in the document metadata.
        #[arg(long, default_value = "")]
        url: String,

        /// Page title recorded in the document metadata.
        #[arg(long, default_value = "")]
        title: String,
    },

    /// Analyze one `processed.json` and print the report.
    Analyze {
        /// Path to a `processed.json` file.
        file: PathBuf,
    },

    /// Upload the prompt store contents once and exit.
    Upload {
        /// List what would be uploaded without touching anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect delivered events.
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// List the projects of a user, newest first.
    History {
        /// User id owning the projects.
        #[arg(long)]
        user: String,
    },

    /// List capture sessions with their counts.
    Sessions,
}

#[derive(Subcommand)]
enum EventsAction {
    /// Print the oldest batch of direct-delivered events.
    Poll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Clean { file, url, title } = &cli.command {
        let cfg = config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal());
        return run_clean(&cfg, file, url, title).await;
    }

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::info!(config = %cli.config.display(), "config file not found, using defaults");
        Config::minimal()
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            for dir in [
                &cfg.paths.capture_dir,
                &cfg.paths.cleaned_dir,
                &cfg.paths.prompt_store,
            ] {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            println!("Database initialized successfully.");
        }
        Commands::Serve => run_serve(cfg).await?,
        Commands::Clean { .. } => unreachable!(),
        Commands::Analyze { file } => run_analyze(&cfg, &file).await?,
        Commands::Upload { dry_run } => run_upload(&cfg, dry_run).await?,
        Commands::Events {
            action: EventsAction::Poll,
        } => {
            let pool = db::connect_migrated(&cfg).await?;
            let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool));
            let mut consumer = FallbackConsumer::new(store, cfg.events.batch_limit);
            let events = consumer.poll_once().await?;
            if events.is_empty() {
                println!("No events.");
            }
            for event in events {
                println!(
                    "{}  {}  {}",
                    event.received_at.to_rfc3339(),
                    event.id,
                    event.payload.image_url.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::History { user } => {
            let pool = db::connect_migrated(&cfg).await?;
            let projects = SqliteProjectStore::new(pool).list_projects(&user).await?;
            if projects.is_empty() {
                println!("No projects for {}.", user);
            }
            for p in projects {
                println!(
                    "{}  {}  {} file(s)  {}",
                    p.created_at.format("%Y-%m-%d %H:%M:%S"),
                    p.project_name,
                    p.files.len(),
                    p.id
                );
            }
        }
        Commands::Sessions => {
            let sessions = capture::list_sessions(&cfg.paths.capture_dir, None).await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for s in sessions {
                println!(
                    "{}  images: {}  html: {}  {} .. {}",
                    s.id,
                    s.image_count,
                    s.html_count,
                    s.start_time.as_deref().unwrap_or("-"),
                    s.end_time.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

async fn run_clean(cfg: &Config, file: &Path, url: &str, title: &str) -> anyhow::Result<()> {
    let html = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let now = chrono::Utc::now();
    let metadata = CaptureMetadata {
        url: url.to_string(),
        title: title.to_string(),
        timestamp: now.timestamp_millis().to_string(),
        capture_time: now.to_rfc3339(),
        original_path: None,
    };
    let max = cfg.cleaning.max_html_bytes;
    let doc = tokio::task::spawn_blocking(move || chunk_html_with_limit(&html, metadata, max)).await??;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn run_analyze(cfg: &Config, file: &Path) -> anyhow::Result<()> {
    let client = AnalysisClient::from_config(&cfg.analysis)?;
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let processed: serde_json::Value = serde_json::from_str(&content)?;

    let key = ArtifactKey::from_path(&cfg.paths.cleaned_dir, file).unwrap_or_else(|| ArtifactKey {
        session: "adhoc".to_string(),
        timestamp: chrono::Utc::now().timestamp_millis().to_string(),
    });
    let has_screenshot = file.with_file_name(ingestor::SCREENSHOT_FILE).exists();
    let payload = ingestor::combined_payload(&key, &processed, has_screenshot)?;

    match client.analyze(&payload).await {
        Some(report) => {
            println!("{}", report.text);
            eprintln!(
                "{}/{} segment(s) analyzed{}",
                report.segments_succeeded,
                report.segments_total,
                if report.summarized { ", summarized" } else { "" }
            );
        }
        None => anyhow::bail!("analysis produced no output"),
    }
    Ok(())
}

async fn run_upload(cfg: &Config, dry_run: bool) -> anyhow::Result<()> {
    let pool = db::connect_migrated(cfg).await?;
    let blobs: Arc<dyn BlobStore> = Arc::new(SqliteBlobStore::new(pool.clone()));
    let projects: Arc<dyn ProjectStore> = Arc::new(SqliteProjectStore::new(pool));
    let uploader = Uploader::new(cfg, blobs, Some(projects))?;

    if dry_run {
        let groups = uploader.scan().await?;
        let total: usize = groups.values().map(|f| f.len()).sum();
        println!("{} file(s) in {} project(s) would be uploaded:", total, groups.len());
        for (project, files) in &groups {
            println!("  {} ({} file(s))", project, files.len());
            for f in files {
                println!("    {}", f.display());
            }
        }
        return Ok(());
    }

    let stats = uploader.run_batch().await?;
    println!(
        "Uploaded {} file(s), {} skipped, {} failed.",
        stats.uploaded, stats.skipped, stats.failed
    );
    Ok(())
}

async fn run_serve(cfg: Config) -> anyhow::Result<()> {
    let pool = match db::connect_migrated(&cfg).await {
        Ok(pool) => Some(pool),
        Err(e) => {
            tracing::error!(error = %e, "database unavailable, uploads, history, and events disabled");
            None
        }
    };

    let projects: Option<Arc<dyn ProjectStore>> = pool
        .clone()
        .map(|p| Arc::new(SqliteProjectStore::new(p)) as Arc<dyn ProjectStore>);
    let blobs: Option<Arc<dyn BlobStore>> = pool
        .clone()
        .map(|p| Arc::new(SqliteBlobStore::new(p)) as Arc<dyn BlobStore>);
    let event_store: Option<Arc<dyn EventStore>> =
        pool.map(|p| Arc::new(SqliteEventStore::new(p)) as Arc<dyn EventStore>);

    let analyzer: Option<Arc<dyn Analyzer>> = if cfg.analysis.is_enabled() {
        match AnalysisClient::from_config(&cfg.analysis) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "analysis disabled, artifacts will be copied only");
                None
            }
        }
    } else {
        None
    };

    let publisher = match &event_store {
        Some(store) => {
            let transport = events::select_transport(&cfg.events).await;
            spawn_consumer(&cfg, &transport, store.clone()).await;
            Some(Arc::new(EventPublisher::new(transport, store.clone())))
        }
        None => None,
    };

    let ingestor = Arc::new(Ingestor::new(&cfg, analyzer, publisher));
    tokio::spawn(async move {
        if let Err(e) = ingestor.run().await {
            tracing::error!(error = %e, "ingestor stopped");
        }
    });

    if let Some(blob_store) = &blobs {
        match Uploader::new(&cfg, blob_store.clone(), projects.clone()) {
            Ok(uploader) => {
                let uploader = Arc::new(uploader);
                tokio::spawn(async move {
                    if let Err(e) = uploader.watch().await {
                        tracing::error!(error = %e, "uploader stopped");
                    }
                });
            }
            Err(e) => tracing::error!(error = %e, "uploader disabled"),
        }
    }

    let sessions = SessionManager::spawn(cfg.paths.capture_dir.clone());
    let state = AppState {
        capture: CaptureService::new(&cfg, sessions),
        projects,
        blobs,
    };

    println!("Capture Harness listening on http://{}", cfg.server.bind);
    server::run_server(&cfg, state).await
}

async fn spawn_consumer(cfg: &Config, transport: &Transport, store: Arc<dyn EventStore>) {
    let interval = Duration::from_secs(cfg.events.poll_interval_secs);
    match transport {
        Transport::Stream(broker) => {
            match StreamConsumer::resume(broker.clone(), store, &cfg.events).await {
                Ok(consumer) => {
                    tokio::spawn(consumer.run(interval));
                }
                Err(e) => tracing::error!(error = %e, "stream consumer disabled"),
            }
        }
        Transport::Direct => {
            let consumer = FallbackConsumer::new(store, cfg.events.batch_limit);
            tokio::spawn(consumer.run(interval));
        }
    }
}
