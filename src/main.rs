//! ToolSupervisor - Launch, track and stop local AI tool backends
//!
//! Runs headless: launches the configured tools, watches them until Ctrl-C,
//! then stops every instance it started before exiting.

#![allow(dead_code)] // Control surface methods are consumed by front-ends, not by main

mod core;
mod persistence;
mod platform;

use std::time::Duration;

use anyhow::{Context, Result};
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::{Settings, Supervisor};
use crate::persistence::Database;

/// Application name constant
pub const APP_NAME: &str = "ToolSupervisor";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Monitor ticks between history cleanups
const PRUNE_EVERY_TICKS: u64 = 3_600;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Two supervisors would fight over the same key file and processes
    let instance = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let db = Database::new()?;
    db.initialize()?;
    info!("Database initialized");

    let mut settings = match db.load_settings() {
        Ok(Some(settings)) => settings,
        Ok(None) => Settings::default(),
        Err(e) => {
            warn!("Failed to load settings, using defaults: {:#}", e);
            Settings::default()
        }
    };
    settings.validate();
    let monitor_interval = Duration::from_millis(settings.monitor_interval_ms as u64);

    let supervisor = Supervisor::new(db, settings)?;

    match supervisor.ensure_admin_key() {
        Ok(credential) => info!("Admin key valid until {}", credential.expires_at),
        Err(e) => error!("Admin key unavailable, privileged operations will be refused: {}", e),
    }

    for (process_type, result) in supervisor.autostart()? {
        match result {
            Ok(id) => info!("Autostarted {} as {}", process_type, id),
            Err(e) => error!("Failed to autostart {}: {}", process_type, e),
        }
    }

    match supervisor.status() {
        Ok(status) => info!(
            "Supervising {} instance(s), host memory {}",
            status.instance_count(),
            status.host_metrics.memory_string()
        ),
        Err(e) => warn!("Failed to read status: {}", e),
    }

    run_monitor_loop(&supervisor, monitor_interval).await;

    let report = supervisor.shutdown().await?;
    for (id, result) in report {
        match result.and_then(|outcome| outcome.into_result(id)) {
            Ok(outcome) => info!("Instance {} stopped ({:?})", id, outcome),
            Err(e) => error!("{}", e),
        }
    }

    info!("{} shutting down", APP_NAME);
    Ok(())
}

/// Poll instances until Ctrl-C
async fn run_monitor_loop(supervisor: &Supervisor, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut ticks: u64 = 0;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = supervisor.refresh() {
                    error!("Failed to refresh instances: {}", e);
                }
                if ticks % PRUNE_EVERY_TICKS == 0 {
                    match supervisor.prune_history() {
                        Ok(0) => {}
                        Ok(n) => info!("Pruned {} history event(s)", n),
                        Err(e) => warn!("Failed to prune history: {}", e),
                    }
                }
                ticks = ticks.wrapping_add(1);
            }
            result = &mut interrupt => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupt received");
                break;
            }
        }
    }
}

/// Initialize the logging system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tool_supervisor=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
