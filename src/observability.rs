use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Lifecycle metrics ───────────────────────────────────────────

/// Counter: bookings committed. Labels: origin (member, admin).
pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

/// Counter: bookings removed. Labels: origin (member, admin, bulk), refunded.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotbook_bookings_cancelled_total";

/// Counter: rejected lifecycle operations. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "slotbook_booking_rejections_total";

/// Counter: per-booking outcomes inside bulk slot changes. Labels: status.
pub const BULK_CANCELLATIONS_TOTAL: &str = "slotbook_bulk_cancellations_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "slotbook_operation_duration_seconds";

// ── Notification metrics ────────────────────────────────────────

/// Counter: notification deliveries. Labels: channel, status.
pub const NOTIFICATIONS_TOTAL: &str = "slotbook_notifications_total";

/// Counter: notifications dropped because the dispatch queue was full.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "slotbook_notifications_dropped_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: slots and audit entries removed by the retention sweep. Labels: kind.
pub const PRUNED_TOTAL: &str = "slotbook_pruned_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map an error to a short label for metrics.
pub fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::SubscriptionExhausted => "subscription_exhausted",
        EngineError::InvalidSlot(_) => "invalid_slot",
        EngineError::UnknownInstructor(_) => "unknown_instructor",
        EngineError::UnknownMember(_) => "unknown_member",
        EngineError::SlotUnavailable => "slot_unavailable",
        EngineError::SlotFull => "slot_full",
        EngineError::DuplicateBooking => "duplicate_booking",
        EngineError::BookingNotFound(_) => "booking_not_found",
        EngineError::Forbidden => "forbidden",
        EngineError::ConfirmationRequired { .. } => "confirmation_required",
        EngineError::InvalidTransition { .. } => "invalid_transition",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::StoreUnavailable(_) => "store_unavailable",
    }
}
