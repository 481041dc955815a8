use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use slotbook::clock::SystemClock;
use slotbook::config::ServiceConfig;
use slotbook::engine::Engine;
use slotbook::notify::{Dispatcher, LogNotifier, NotifyHub};
use slotbook::reaper;
use slotbook::store::WalStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServiceConfig::from_env()?;
    slotbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("slotbook.wal");
    let store = Arc::new(WalStore::open(&wal_path, config.engine.slot_capacity)?);

    let (dispatcher, worker) = Dispatcher::start(
        Arc::new(LogNotifier),
        Arc::new(NotifyHub::new()),
        config.notify_queue,
        config.notify_concurrency,
    );
    let engine = Arc::new(Engine::new(
        store,
        dispatcher,
        Arc::new(SystemClock),
        config.engine.clone(),
    )?);

    info!("slotbook started");
    info!("  wal: {}", wal_path.display());
    info!("  slot_capacity: {}", config.engine.slot_capacity);
    info!("  reminders at {:02}:00 UTC", config.reminder_hour);
    info!(
        "  retention: slots {}d, audit {}d",
        config.slot_retention_days, config.audit_retention_days
    );

    let tasks = vec![
        tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold)),
        tokio::spawn(reaper::run_retention(
            engine.clone(),
            config.slot_retention_days,
            config.audit_retention_days,
        )),
        tokio::spawn(reaper::run_reminders(engine.clone(), config.reminder_hour)),
    ];

    shutdown_signal().await?;
    info!("shutdown signal received, stopping background tasks");

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }

    // Last engine handle: dropping it closes the notification queue.
    drop(engine);
    info!("draining notifications...");
    if tokio::time::timeout(Duration::from_secs(10), worker).await.is_err() {
        warn!("drain timeout, pending notifications dropped");
    }

    info!("slotbook stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
