//! # Cashline Sync Worker
//!
//! Runs the sync engine against the local register database.
//!
//! ## Usage
//! ```bash
//! # Run on the configured schedule until Ctrl-C
//! sync-worker
//!
//! # One invocation, then exit (cron / systemd timer)
//! sync-worker --once
//!
//! # Operator tools
//! sync-worker --status
//! sync-worker --requeue <COMMAND_ID>
//! sync-worker --force-unlock
//!
//! # Write sync.toml with a fresh device id (once per register)
//! sync-worker --init-config
//! ```
//!
//! ## Environment
//! - `CASHLINE_DB_PATH` - database file (default: platform data dir)
//! - `RUST_LOG` - log filter (default: `info,cashline=debug,sqlx=warn`)
//! - `CASHLINE_*` config overrides, see `SyncConfig`

use std::path::PathBuf;
use std::sync::Arc;

use cashline_core::CommandStatus;
use cashline_db::{Database, DbConfig};
use cashline_sync::{
    EngineOptions, HttpRemoteApi, RunOutcome, SyncConfig, SyncEngine, SyncQueue, SyncScheduler,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// What the process was asked to do.
#[derive(Debug, PartialEq)]
enum Mode {
    Schedule,
    Once,
    Status,
    Requeue(String),
    ForceUnlock,
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut mode = Mode::Schedule;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--once" => mode = Mode::Once,
            "--status" => mode = Mode::Status,
            "--force-unlock" => mode = Mode::ForceUnlock,
            "--init-config" => mode = Mode::InitConfig,
            "--requeue" => {
                if i + 1 < args.len() {
                    mode = Mode::Requeue(args[i + 1].clone());
                    i += 1;
                } else {
                    return Err("--requeue needs a command id".into());
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => warn!(arg = %other, "Ignoring unknown argument"),
        }
        i += 1;
    }

    if mode == Mode::InitConfig {
        return init_config(config_path);
    }

    let config = SyncConfig::load(config_path)?;
    let db_path = database_path();
    info!(
        device_id = %config.device_id(),
        db = %db_path.display(),
        remote = config.remote_url().unwrap_or("<unset>"),
        "Cashline sync worker starting"
    );

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(DbConfig::new(&db_path)).await?;

    match mode {
        Mode::Status => print_status(&db).await?,
        Mode::Requeue(command_id) => {
            SyncQueue::new(db.clone()).requeue(&command_id).await?;
            println!("Requeued {}", command_id);
        }
        Mode::ForceUnlock => {
            let holder = db.sync_lock().current().await?;
            db.sync_lock().force_release().await?;
            println!(
                "Sync lock cleared (was held by {})",
                holder.locked_by.as_deref().unwrap_or("nobody")
            );
        }
        Mode::Once => {
            let engine = build_engine(&config, &db)?;
            let report = engine.run().await?;
            println!(
                "{}: {} processed, {} recovered in {:?}",
                report.outcome, report.processed, report.recovered, report.duration
            );
            if let Some(blocked) = &report.blocked_on {
                println!(
                    "blocked on #{} {} ({} attempts): {}",
                    blocked.sequence,
                    blocked.command_type,
                    blocked.attempts,
                    blocked.error.as_deref().unwrap_or("-")
                );
            }
            if report.outcome == RunOutcome::Blocked {
                db.close().await;
                std::process::exit(2);
            }
        }
        Mode::Schedule => {
            let engine = build_engine(&config, &db)?;
            let (scheduler, handle) =
                SyncScheduler::new(engine, db.clone(), config.schedule.clone());
            let task = tokio::spawn(scheduler.run());

            shutdown_signal().await;

            if let Err(e) = handle.shutdown().await {
                error!(error = %e, "Scheduler already stopped");
            }
            task.await?;
        }
        Mode::InitConfig => unreachable!("--init-config returns before the database is opened"),
    }

    db.close().await;
    Ok(())
}

/// Writes a default config with a generated device id. Never overwrites.
fn init_config(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path
        .or_else(SyncConfig::default_config_path)
        .ok_or("no config directory available, pass --config")?;
    if path.exists() {
        return Err(format!("{} already exists", path.display()).into());
    }

    let config = SyncConfig::new();
    config.save(Some(path.clone()))?;
    println!("Wrote {} (device id {})", path.display(), config.device_id());
    Ok(())
}

fn build_engine(
    config: &SyncConfig,
    db: &Database,
) -> Result<SyncEngine, Box<dyn std::error::Error>> {
    let remote = HttpRemoteApi::from_settings(&config.remote)?;
    Ok(SyncEngine::new(
        db.clone(),
        Arc::new(remote),
        EngineOptions::from_config(config),
    ))
}

async fn print_status(db: &Database) -> Result<(), Box<dyn std::error::Error>> {
    let schema = db.migration_status().await?;
    let stats = db.commands().stats().await?;
    let lock = db.sync_lock().current().await?;

    println!(
        "Database: {} (schema {}/{}{})",
        if db.health_check().await { "ok" } else { "unreachable" },
        schema.applied,
        schema.embedded,
        if schema.is_current() { "" } else { ", behind" }
    );
    println!("Queue");
    println!("  pending: {}", stats.pending);
    println!("  running: {}", stats.running);
    println!("  failed:  {}", stats.failed);
    println!("  done:    {}", stats.done);
    println!("Lock: {}", lock.locked_by.as_deref().unwrap_or("free"));

    for command in db.commands().list_by_status(CommandStatus::Failed).await? {
        println!(
            "  failed #{} {} {} ({} attempts): {}",
            command.sequence,
            command.command_type,
            command.id,
            command.attempts,
            command.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=cashline=trace` - Show trace for cashline crates only
/// - Default: INFO, DEBUG for cashline crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cashline=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Determines the database file path.
///
/// `CASHLINE_DB_PATH` wins, then the platform data directory, then the
/// working directory.
fn database_path() -> PathBuf {
    if let Ok(path) = std::env::var("CASHLINE_DB_PATH") {
        return PathBuf::from(path);
    }

    SyncConfig::default_database_path().unwrap_or_else(|| PathBuf::from("cashline.db"))
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping scheduler...");
}

fn print_help() {
    println!("Cashline Sync Worker");
    println!();
    println!("Usage: sync-worker [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config <PATH>     Config file (default: platform config dir)");
    println!("      --once              Run one sync and exit (exit code 2 if blocked)");
    println!("      --status            Show queue counts, lock holder and failed commands");
    println!("      --requeue <ID>      Move a failed command back to pending");
    println!("      --force-unlock      Clear the sync lock regardless of holder");
    println!("      --init-config       Write a default config with a new device id");
    println!("  -h, --help              Show this help message");
}
