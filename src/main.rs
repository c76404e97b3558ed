//! Lumen: photo management server with a durable SQLite-backed job
//! pipeline.
//!
//! Wires the store, the worker pool, the maintenance loops and the HTTP
//! surface together, then serves until killed. Configuration comes from an
//! optional TOML file with CLI/env overrides on top.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lumen_jobs::maintenance::Maintenance;
use lumen_jobs::{EventBus, HandlerContext, HandlerRegistry, Orchestrator, WorkerPool};
use lumen_media::{LocalProjectStore, MockProcessor, ProjectPaths};
use lumen_server::{AppState, ServerConfig};
use lumen_store::Db;

use config::LumenConfig;

#[derive(Debug, Parser)]
#[command(
    name = "lumen",
    version,
    about = "Photo management server with a durable job pipeline"
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, env = "LUMEN_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address override
    #[arg(long, env = "LUMEN_HOST")]
    host: Option<String>,

    /// Port override
    #[arg(long, env = "LUMEN_PORT")]
    port: Option<u16>,

    /// Directory for per-tenant SQLite files
    #[arg(long, env = "LUMEN_DB_ROOT")]
    db_root: Option<PathBuf>,

    /// Root of the project folder trees
    #[arg(long, env = "LUMEN_PROJECTS_ROOT")]
    projects_root: Option<PathBuf>,

    /// Tenant to serve
    #[arg(long, env = "LUMEN_TENANT")]
    tenant: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,lumen=debug".into()),
        )
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => LumenConfig::load(path)?,
        None => LumenConfig::default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db_root) = cli.db_root {
        config.storage.db_root = db_root;
    }
    if let Some(projects_root) = cli.projects_root {
        config.storage.projects_root = projects_root;
    }
    if let Some(tenant) = cli.tenant {
        config.storage.tenant = tenant;
    }

    tracing::info!(
        tenant = %config.storage.tenant,
        db_root = %config.storage.db_root.display(),
        projects_root = %config.storage.projects_root.display(),
        "starting lumen"
    );

    let db = Db::open(&config.storage.db_root, &config.storage.tenant)
        .await
        .context("failed to open tenant database")?;
    let store = Arc::new(LocalProjectStore::new(&config.storage.projects_root));
    let paths = ProjectPaths::new(&config.storage.projects_root, &config.storage.tenant);

    // The codec lives behind the ImageProcessor capability; the bundled
    // mock keeps a dev deployment self-contained.
    tracing::warn!("using the built-in mock image processor");
    let processor = Arc::new(MockProcessor::default());

    let bus = EventBus::new();
    let ctx = HandlerContext::new(
        db.clone(),
        store.clone(),
        processor,
        paths.clone(),
        bus.clone(),
        config.media.clone(),
    );
    let orchestrator = Orchestrator::new(
        ctx.repo.clone(),
        ctx.photos.clone(),
        ctx.projects.clone(),
        bus.clone(),
        config.orchestrator.fanout_width,
    );

    let registry = Arc::new(HandlerRegistry::builtin());
    let _pool = WorkerPool::spawn(
        ctx.clone(),
        registry,
        orchestrator,
        config.workers.clone(),
    );
    let _maintenance = Maintenance::spawn(
        ctx.repo.clone(),
        bus.clone(),
        &config.workers,
        Duration::from_secs(config.maintenance.rotation_check_interval_secs),
    );

    // Requeue anything a previous process left mid-flight.
    let recovered = ctx
        .repo
        .requeue_stale_running(config.workers.stale_timeout_secs as i64)
        .await?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "recovered jobs from a previous run");
        bus.notify_enqueued();
    }

    let state = AppState::new(db, store, paths, bus, config.media.clone());
    let server_config = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
    };
    lumen_server::run_server(server_config, state)
        .await
        .context("server error")?;
    Ok(())
}
