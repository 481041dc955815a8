use std::time::Instant;

use tracing::{info, warn};

use crate::model::*;
use crate::notify::NoticeKind;
use crate::observability;

use super::{Engine, EngineError};

/// Admin request to change every slot at one start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotChange {
    pub starts_at: Ms,
    pub scope: SlotScope,
    pub state: SlotState,
    pub disabled: bool,
    /// Caller has seen the `has_bookings` count and accepts the cancellations.
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub slots_updated: usize,
    pub cancelled: usize,
    /// Bookings whose cancellation failed; they remain in place.
    pub failed: usize,
}

impl Engine {
    /// Number of SIMPLE bookings at `starts_at` within `scope`.
    pub async fn has_bookings(&self, starts_at: Ms, scope: SlotScope) -> Result<usize, EngineError> {
        Ok(self
            .store
            .bookings_at(starts_at)
            .await?
            .iter()
            .filter(|b| b.is_simple() && scope.includes(b.instructor_id))
            .count())
    }

    /// Move every slot at `starts_at` in `scope` to a new state.
    ///
    /// Leaving `Free` cancels the SIMPLE bookings there, with an unconditional refund.
    /// Slots are closed before the cascade so no new booking lands mid-way. The
    /// cascade is best-effort: each cancellation is atomic, the loop is not.
    pub async fn admin_set_slot_state(&self, change: SlotChange) -> Result<BulkOutcome, EngineError> {
        let started = Instant::now();
        let result = self.try_set_slot_state(change).await;
        self.observe("admin_set_slot_state", started, &result);
        result
    }

    async fn try_set_slot_state(&self, change: SlotChange) -> Result<BulkOutcome, EngineError> {
        let SlotChange {
            starts_at,
            scope,
            state,
            confirmed,
            ..
        } = change;
        self.check_grid(starts_at)?;
        let disabled = change.disabled && state != SlotState::Free;

        let instructors = match scope {
            SlotScope::All => self.store.list_instructors().await?,
            SlotScope::Instructor(id) => vec![self.require_instructor(id).await?],
        };

        let mut targets = Vec::with_capacity(instructors.len());
        for instructor in &instructors {
            let slot = self
                .store
                .get_or_create_slot(SlotKey::new(instructor.id, starts_at))
                .await?;
            if slot.state == state && slot.disabled == disabled {
                continue;
            }
            if slot.state != state && !slot.state.can_become(state) {
                return Err(EngineError::InvalidTransition {
                    from: slot.state,
                    to: state,
                });
            }
            targets.push(slot);
        }

        let in_scope = |b: &Booking| b.is_simple() && scope.includes(b.instructor_id);
        if state != SlotState::Free && !confirmed {
            let live = self
                .store
                .bookings_at(starts_at)
                .await?
                .iter()
                .filter(|b| in_scope(b))
                .count();
            if live > 0 {
                return Err(EngineError::ConfirmationRequired { bookings: live });
            }
        }

        let mut outcome = BulkOutcome::default();
        for slot in &targets {
            self.store
                .set_slot_state(slot.key(), state, disabled)
                .await?;
            outcome.slots_updated += 1;
            self.record_audit(None, starts_at, AuditKind::for_transition(slot.state, state))
                .await;
        }

        // Read after closing: a booking committed before the close is in this list,
        // one committing after it backs itself out in `create_booking`.
        let victims: Vec<Booking> = if state == SlotState::Free {
            Vec::new()
        } else {
            self.store
                .bookings_at(starts_at)
                .await?
                .into_iter()
                .filter(|b| in_scope(b))
                .collect()
        };

        for booking in victims {
            match self.unbook(booking.id, true).await {
                Ok(cancelled) => {
                    outcome.cancelled += 1;
                    metrics::counter!(observability::BULK_CANCELLATIONS_TOTAL, "status" => "ok").increment(1);
                    self.record_audit(cancelled.booking.member_id, starts_at, AuditKind::Deleted)
                        .await;
                    let notice = self.notice_for(&cancelled.booking).await;
                    self.dispatcher
                        .submit(NoticeKind::Cancelled, cancelled.booking.instructor_id, notice);
                }
                // Someone else removed it first.
                Err(EngineError::BookingNotFound(_)) => {}
                Err(e) => {
                    outcome.failed += 1;
                    metrics::counter!(observability::BULK_CANCELLATIONS_TOTAL, "status" => "error")
                        .increment(1);
                    warn!(booking = %booking.id, "bulk cancellation failed: {e}");
                }
            }
        }

        info!(
            slot = %format_rfc3339(starts_at),
            state = state.label(),
            disabled,
            updated = outcome.slots_updated,
            cancelled = outcome.cancelled,
            failed = outcome.failed,
            "slot state changed"
        );
        Ok(outcome)
    }
}
