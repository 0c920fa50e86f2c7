use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use transit_agent::dispatch::CompositeTransferAgent;
use transit_core::OrchestratorConfig;
use transit_history::HistoryStore;
use transit_orchestrator::{
    BroadcastEventPublisher, NullWakeLock, Orchestrator, ResourceGuard,
};

use crate::config;

pub async fn init_config(config_path: &Path) -> Result<()> {
    let default_config = OrchestratorConfig::default();
    config::save_config(config_path, &default_config).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nPlease review and edit the configuration before starting the service.");
    Ok(())
}

/// Wire up and run the transfer orchestrator as a long-lived background
/// service (spec.md §1, §2). The RPC/bus surface that would expose this
/// to real callers is out of scope (spec.md §1); this entry point starts
/// the orchestrator and keeps it alive until `Ctrl+C`.
pub async fn run(config_path: &Path) -> Result<()> {
    info!("starting transit transfer orchestrator...");

    let config = config::load_config(config_path)
        .await
        .context("failed to load configuration")?;
    info!("configuration loaded from {}", config_path.display());

    tokio::fs::create_dir_all(&config.download_path)
        .await
        .context("failed to create download directory")?;

    let history = HistoryStore::open(&config.history_db_path)
        .await
        .context("failed to open history store")?;

    // Restart recovery: every running/queued/interrupted row becomes
    // cancelled before any new admission is allowed (spec.md §3, §9).
    let rewritten = history
        .cancel_unfinished_on_startup()
        .await
        .context("failed to run restart recovery over the history store")?;
    if rewritten > 0 {
        info!("restart recovery cancelled {rewritten} unfinished row(s)");
    }
    let max_ticket = history.max_ticket().await.unwrap_or(0);

    let agent = Arc::new(CompositeTransferAgent::new());
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let resources = ResourceGuard::new(&config, Box::new(NullWakeLock));

    let stall_window = Duration::from_secs(config.stall_window_secs.max(1));
    let handle = Orchestrator::spawn(config, agent, history, publisher, resources, max_ticket);

    let watchdog_handle = handle.clone();
    let watchdog = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stall_window / 2);
        loop {
            ticker.tick().await;
            watchdog_handle.sweep();
        }
    });

    info!("transit orchestrator is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("shutting down...");

    watchdog.abort();
    handle.shutdown().await;

    Ok(())
}
