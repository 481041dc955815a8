use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::model::{DAY, HOUR, Ms, format_rfc3339};
use crate::observability;
use crate::store::{PruneReport, StoreError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Background task that rewrites the WAL as a snapshot once it has grown enough.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            error!("compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` events were appended since the last snapshot.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, StoreError> {
    let pending = engine.store().appends_since_compact().await;
    if pending < threshold {
        return Ok(false);
    }
    engine.store().compact().await?;
    info!(events = pending, "wal compacted");
    Ok(true)
}

/// Background task that drops old slots and audit entries, then compacts.
pub async fn run_retention(engine: Arc<Engine>, slot_days: i64, audit_days: i64) {
    let mut interval = tokio::time::interval(RETENTION_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = prune_once(&engine, slot_days, audit_days).await {
            error!("retention sweep failed: {e}");
        }
    }
}

pub async fn prune_once(engine: &Engine, slot_days: i64, audit_days: i64) -> Result<PruneReport, StoreError> {
    let now = engine.now();
    let report = engine
        .store()
        .prune(now - slot_days * DAY, now - audit_days * DAY)
        .await?;
    metrics::counter!(observability::PRUNED_TOTAL, "kind" => "slot").increment(report.slots as u64);
    metrics::counter!(observability::PRUNED_TOTAL, "kind" => "audit")
        .increment(report.audit_entries as u64);
    if report != PruneReport::default() {
        engine.store().compact().await?;
        info!(slots = report.slots, audit = report.audit_entries, "retention sweep");
    }
    Ok(report)
}

/// Background task that sends each day's reminders at `hour` UTC.
pub async fn run_reminders(engine: Arc<Engine>, hour: u32) {
    loop {
        let now = engine.now();
        let due = next_run(now, hour);
        tokio::time::sleep(Duration::from_millis((due - now).max(0) as u64)).await;
        match engine.send_reminders(due).await {
            Ok(report) if report.failed > 0 => {
                warn!(day = %format_rfc3339(due), sent = report.sent, failed = report.failed, "reminders partly failed")
            }
            Ok(report) => info!(day = %format_rfc3339(due), sent = report.sent, "reminders sent"),
            Err(e) => error!("reminder run failed: {e}"),
        }
    }
}

/// Next instant strictly after `now` that falls on `hour` UTC.
fn next_run(now: Ms, hour: u32) -> Ms {
    let today = now - now.rem_euclid(DAY) + i64::from(hour) * HOUR;
    if today > now { today } else { today + DAY }
}
