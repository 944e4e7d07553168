//! corral daemon - binds the host stream listener and serves until signalled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use corral::{ControlPlane, ControlPlaneConfig, SqliteStore};
use corralconf::CorralConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Corral - sandbox-fleet control plane
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Explicit config file (overrides ./corral.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// ROUTER bind address for host streams
    #[arg(long)]
    bind: Option<String>,

    /// Sqlite database path
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CorralConfig::load_from(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind.router = bind;
    }
    if let Some(db) = args.db {
        config.paths.db_path = db;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level)),
        )
        .init();

    info!("corral starting");
    info!("  bind: {}", config.bind.router);
    info!("  db: {}", config.paths.db_path.display());
    info!(
        "  heartbeat: check every {:?}, overdue after {:?}",
        config.heartbeat_check_interval(),
        config.heartbeat_overdue_threshold()
    );

    let store = Arc::new(SqliteStore::open(&config.paths.db_path)?);
    let plane = Arc::new(ControlPlane::new(
        ControlPlaneConfig::from_config(&config),
        store,
    ));

    // SIGINT begins teardown: in-flight calls fail with Shutdown, sessions
    // and the listener drain out.
    let signal_plane = plane.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        signal_plane.shutdown();
    });

    plane.run().await?;

    info!("corral shutdown complete");
    Ok(())
}
