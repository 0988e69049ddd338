#![forbid(unsafe_code)]

//! `nbhydra` binary: per-user notebook server supervisor.
//!
//! Loads configuration, opens the session registry, reconciles recorded
//! sessions, and serves the login/admin HTTP front end until shutdown.
//! Running session servers are left alone on shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use nbhydra::config::GlobalConfig;
use nbhydra::orchestrator::liveness::ProcessTable;
use nbhydra::orchestrator::session_manager::SessionManager;
use nbhydra::orchestrator::spawner::NotebookSpawner;
use nbhydra::persistence::db;
use nbhydra::persistence::session_repo::SessionRepo;
use nbhydra::{http, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "nbhydra", about = "Per-user notebook server supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the directory holding user workspaces.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("nbhydra bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|err| AppError::Io(format!("cannot create data_dir: {err}")))?;
    config.data_dir = config
        .data_dir
        .canonicalize()
        .map_err(|err| AppError::Config(format!("data_dir invalid: {err}")))?;

    let config = Arc::new(config);
    info!(
        data_dir = %config.data_dir.display(),
        pool_low = config.port_pool.low,
        pool_high = config.port_pool.high,
        pool_capacity = config.port_pool.capacity(),
        "configuration loaded"
    );

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(path = %config.db_path.display(), "database connected");

    // ── Build the supervisor ────────────────────────────
    let sessions = Arc::new(
        SessionManager::new(
            Arc::clone(&config),
            SessionRepo::new(db),
            Arc::new(ProcessTable),
            Arc::new(NotebookSpawner::new(config.server.clone())),
        )
        .await?,
    );
    sessions.reconcile().await?;

    // ── Serve HTTP until shutdown ───────────────────────
    let bind = SocketAddr::new(config.bind_address, config.http_port);
    http::run_until(sessions, bind, shutdown_signal()).await?;
    info!("nbhydra shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
