mod availability;
mod bulk;
mod error;
mod mutations;
pub mod policy;
mod queries;
mod reminders;

pub use availability::open_starts;
pub use bulk::{BulkOutcome, SlotChange};
pub use error::EngineError;
pub use mutations::{AdminBooking, AdminCreated, CancelOutcome};
pub use reminders::ReminderReport;

use std::sync::Arc;
use std::time::Instant;

use ulid::Ulid;

use crate::clock::Clock;
use crate::config::{ConfigError, EngineConfig};
use crate::model::*;
use crate::notify::{Dispatcher, Notice, NotifyHub};
use crate::observability;
use crate::store::{BookingStore, SeatClaim, StoreError};

/// The booking lifecycle engine.
///
/// Composes the slot, ledger and credit operations of a [`BookingStore`]. Each
/// store call is atomic on its own; a multi-step operation that fails part way
/// unwinds its earlier steps before returning.
pub struct Engine {
    store: Arc<dyn BookingStore>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            dispatcher,
            clock,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<NotifyHub> {
        self.dispatcher.hub()
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Record latency and, on failure, the rejection reason.
    fn observe<T>(&self, op: &'static str, started: Instant, result: &Result<T, EngineError>) {
        metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = result {
            metrics::counter!(
                observability::BOOKING_REJECTIONS_TOTAL,
                "reason" => observability::rejection_label(e)
            )
            .increment(1);
            tracing::debug!(op, "rejected: {e}");
        }
    }

    fn check_grid(&self, starts_at: Ms) -> Result<(), EngineError> {
        if self.config.hours.is_grid_point(starts_at) {
            Ok(())
        } else {
            Err(EngineError::InvalidSlot(starts_at))
        }
    }

    async fn require_instructor(&self, id: Ulid) -> Result<Instructor, EngineError> {
        self.store
            .get_instructor(id)
            .await?
            .ok_or(EngineError::UnknownInstructor(id))
    }

    async fn require_member(&self, id: Ulid) -> Result<MemberAccount, EngineError> {
        self.store
            .get_member(id)
            .await?
            .ok_or(EngineError::UnknownMember(id))
    }

    /// Conditional seat increment, mapped onto the caller-facing error kinds.
    async fn claim_seat(&self, key: SlotKey, limit: u32) -> Result<Slot, EngineError> {
        match self.store.claim_seat(key, limit).await? {
            SeatClaim::Claimed(slot) => Ok(slot),
            SeatClaim::Unavailable(_) => Err(EngineError::SlotUnavailable),
            SeatClaim::Full(_) => Err(EngineError::SlotFull),
        }
    }

    /// Whether a bulk slot change closed `key` after this operation claimed its seat.
    /// A failed read counts as open; the bulk cascade rescans after closing.
    async fn closed_after_claim(&self, key: SlotKey) -> bool {
        match self.store.get_or_create_slot(key).await {
            Ok(slot) => matches!(slot.occupancy(u32::MAX), Occupancy::Closed),
            Err(e) => {
                tracing::warn!(slot = %format_rfc3339(key.starts_at), "slot recheck failed: {e}");
                false
            }
        }
    }

    /// Undo a committed SIMPLE booking whose slot closed underneath it.
    async fn back_out(&self, booking_id: Ulid, refund: bool) -> Result<(), EngineError> {
        match self.unbook(booking_id, refund).await {
            // Removed by whoever got there first; that path refunded and released.
            Ok(_) | Err(EngineError::BookingNotFound(_)) => {
                tracing::info!(booking = %booking_id, "slot closed during booking, backed out");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Audit entries are best-effort: a failed append is logged, never surfaced.
    async fn record_audit(&self, member_id: Option<Ulid>, starts_at: Ms, kind: AuditKind) {
        let entry = AuditEntry {
            id: Ulid::new(),
            member_id,
            starts_at,
            kind,
            occurred_at: self.clock.now(),
        };
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::warn!(kind = kind.label(), "audit append failed: {e}");
        }
    }

    async fn notice_for(&self, booking: &Booking) -> Notice {
        let member = match booking.member_id {
            Some(id) => self.store.get_member(id).await.ok().flatten(),
            None => None,
        };
        let instructor = self
            .store
            .get_instructor(booking.instructor_id)
            .await
            .ok()
            .flatten();
        Notice {
            member_name: member
                .as_ref()
                .map_or_else(|| "studio".to_string(), MemberAccount::full_name),
            member_email: member.map(|m| m.email),
            instructor_name: instructor
                .map_or_else(|| booking.instructor_id.to_string(), |i| i.full_name()),
            starts_at: booking.starts_at,
            issued_at: self.clock.now(),
        }
    }
}

// ── Compensation ─────────────────────────────────────────

/// A step that reverses one already-committed store mutation.
#[derive(Debug, Clone)]
enum Undo {
    ReleaseSeat(SlotKey),
    RestoreSeat(SlotKey),
    DropBooking(Ulid),
    RestoreBooking(Booking),
}

/// Steps taken so far by one operation, unwound newest first on failure.
struct Compensation<'a> {
    store: &'a dyn BookingStore,
    steps: Vec<Undo>,
}

impl<'a> Compensation<'a> {
    fn new(store: &'a dyn BookingStore) -> Self {
        Self {
            store,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, step: Undo) {
        self.steps.push(step);
    }

    /// Unwind, then hand back `err`. Unwinding failures are logged and never replace it.
    ///
    /// If the booking was already removed by someone else, that remover released its
    /// seat, so the seat step is skipped.
    async fn fail<T>(self, err: EngineError) -> Result<T, EngineError> {
        let mut removed_elsewhere = false;
        for step in self.steps.into_iter().rev() {
            if removed_elsewhere && matches!(step, Undo::ReleaseSeat(_)) {
                continue;
            }
            match Self::revert(self.store, &step).await {
                Ok(still_held) => removed_elsewhere |= !still_held,
                Err(e) => tracing::error!(?step, "compensation failed: {e}"),
            }
        }
        Err(err)
    }

    /// Returns false when a `DropBooking` found nothing left to drop.
    async fn revert(store: &dyn BookingStore, step: &Undo) -> Result<bool, StoreError> {
        match step {
            Undo::ReleaseSeat(key) => store.release_seat(*key).await.map(|_| true),
            Undo::RestoreSeat(key) => store.restore_seat(*key).await.map(|_| true),
            Undo::DropBooking(id) => store.remove_booking(*id).await.map(|b| b.is_some()),
            Undo::RestoreBooking(booking) => store.insert_booking(booking.clone()).await.map(|()| true),
        }
    }
}
