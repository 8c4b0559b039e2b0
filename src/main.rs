use std::path::PathBuf;
use std::sync::Arc;

use aggregoor::config::Config;
use aggregoor::context::EngineContext;
use aggregoor::export::health::HealthMetrics;
use aggregoor::storage::document::DocumentBackend;
use aggregoor::storage::memory::MemoryBackend;
use aggregoor::storage::relational::RelationalBackend;
use aggregoor::storage::sharded::ShardedBackend;
use aggregoor::storage::{BackendKind, StorageBackend};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// Streaming aggregation engine for tracing and metrics collectors.
#[derive(Parser)]
#[command(name = "aggregoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Validate the configuration and print the resolved roles.
    CheckConfig,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("aggregoor {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(Command::CheckConfig) = &cli.command {
        return check_config(&cfg);
    }

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        backend = cfg.storage.backend.as_str(),
        "starting aggregoor",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { serve(cfg).await })
}

fn check_config(cfg: &Config) -> Result<()> {
    let roles = cfg.resolve_roles()?;

    println!(
        "{:<20} {:<16} {:<10} {:>5} {:>6} {:>8}",
        "ROLE", "PERSISTENCE", "SELECTOR", "POOL", "ATTRS", "VERSION"
    );
    for role in &roles {
        println!(
            "{:<20} {:<16} {:<10} {:>5} {:>6} {:>8}",
            role.name,
            role.persistence.as_str(),
            role.selector.as_str(),
            role.pool_size,
            role.schema.attribute_count(),
            role.schema.version(),
        );
    }
    println!("backend: {}", cfg.storage.backend.as_str());

    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    health.start().await?;

    let result = match cfg.storage.backend {
        BackendKind::Memory => run(&cfg, MemoryBackend::new(), &health).await,
        BackendKind::Document => {
            let backend =
                DocumentBackend::new(cfg.storage.document.clone(), Some(Arc::clone(&health)))?;
            run(&cfg, backend, &health).await
        }
        BackendKind::Relational => {
            let backend =
                RelationalBackend::new(cfg.storage.relational.clone(), Some(Arc::clone(&health)));
            run(&cfg, backend, &health).await
        }
        BackendKind::Sharded => {
            let backend =
                ShardedBackend::new(cfg.storage.sharded.clone(), Some(Arc::clone(&health)))?;
            run(&cfg, backend, &health).await
        }
    };

    health.stop().await?;
    result
}

async fn run<B: StorageBackend>(cfg: &Config, backend: B, health: &Arc<HealthMetrics>) -> Result<()> {
    let mut engine = EngineContext::build(cfg, backend, Some(Arc::clone(health)))?;
    if let Some(addr) = engine.start().await? {
        tracing::info!(addr = %addr, "accepting forwarded records");
    }

    wait_for_signal().await?;

    engine.stop().await?;
    tracing::info!("aggregoor stopped");

    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
