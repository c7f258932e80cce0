// ============================================================================
// MAIN - controller process wiring
// ============================================================================

use cpe_presence_backend::config::{Config, StatusRefreshMode};
use cpe_presence_backend::presence::{DeviceDirectory, InMemoryDeviceDirectory};
use cpe_presence_backend::refresh_engine::{RefreshEngine, RefreshError};
use cpe_presence_backend::refresh_task::{RefreshMode, SqliteTaskStore, TaskStore};
use cpe_presence_backend::wake_listener::{spawn_presence_updater, WakeListener};
use cpe_presence_backend::wake_sender::WakeSender;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    // Logging configuration with environment variable support
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    // Load .env if present, then the typed configuration
    let _ = dotenvy::dotenv();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!(
        "starting CPE presence controller (listen port {}, batch size {})",
        config.wake_listen_port, config.refresh_batch_size
    );

    // Task store is the source of truth across restarts
    let store: Arc<dyn TaskStore> = match SqliteTaskStore::new(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open task store: {}", e);
            std::process::exit(1);
        }
    };

    let directory: Arc<dyn DeviceDirectory> = Arc::new(InMemoryDeviceDirectory::new());

    let acs_addr = SocketAddr::new(config.acs_ip, config.acs_port);
    let sender = match WakeSender::bind(acs_addr, config.acs_url.clone()).await {
        Ok(sender) => sender,
        Err(e) => {
            error!("failed to bind wake sender socket: {}", e);
            std::process::exit(1);
        }
    };

    // Wake listener feeds the device directory; the sender answers discoveries
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut listener = WakeListener::new(config.wake_listen_port, event_tx);
    if let Err(e) = listener.start().await {
        error!("{}", e);
        std::process::exit(1);
    }
    spawn_presence_updater(event_rx, Arc::clone(&directory), sender.clone());

    let engine = Arc::new(RefreshEngine::new(
        Arc::clone(&directory),
        Arc::clone(&store),
        sender,
        config.clone(),
    ));

    // A crash leaves the interrupted sweep stuck in running; fix the record
    match engine.reconcile_interrupted_tasks().await {
        Ok(0) => {}
        Ok(n) => warn!("reconciled {} refresh task(s) interrupted by restart", n),
        Err(e) => error!("startup reconciliation failed: {}", e),
    }

    if config.status_refresh_mode == StatusRefreshMode::Timed {
        spawn_timed_refresh_loop(Arc::clone(&engine), config.timed_refresh_interval_ms);
    }

    info!("controller running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for shutdown signal: {}", e);
    }

    info!("shutting down");
    listener.stop();
}

/// Timed refresh mode: periodically attempt a normal-mode sweep, skipping
/// quietly when one is already running or the cooldown is active.
fn spawn_timed_refresh_loop(engine: Arc<RefreshEngine>, interval_ms: u64) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet
        timer.tick().await;
        loop {
            timer.tick().await;
            match engine.start_refresh(RefreshMode::Normal, "timer").await {
                Ok(task_id) => info!("timed refresh started: {}", task_id),
                Err(RefreshError::AlreadyRunning { running_task_id }) => {
                    debug!("timed refresh skipped, {} still running", running_task_id);
                }
                Err(RefreshError::CooldownActive { .. }) => {
                    debug!("timed refresh skipped, cooldown active");
                }
                Err(e) => warn!("timed refresh failed to start: {}", e),
            }
        }
    });
}
