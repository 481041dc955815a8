use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NoticeKind;
use crate::observability;
use crate::store::StoreError;

use super::{Compensation, Engine, EngineError, Undo, policy};

/// Result of removing a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub booking: Booking,
    pub refunded: bool,
}

/// A staff-initiated reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminBooking {
    pub member_id: Option<Ulid>,
    pub instructor_id: Ulid,
    pub starts_at: Ms,
    pub kind: BookingKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCreated {
    pub booking: Booking,
    /// Whether the member was told. Delivery failure never fails the booking.
    pub notice_delivered: bool,
}

impl Engine {
    /// Member books one seat with `instructor_id` at `starts_at`.
    pub async fn create_booking(
        &self,
        member_id: Ulid,
        instructor_id: Ulid,
        starts_at: Ms,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.try_create_booking(member_id, instructor_id, starts_at).await;
        self.observe("create_booking", started, &result);
        result
    }

    async fn try_create_booking(
        &self,
        member_id: Ulid,
        instructor_id: Ulid,
        starts_at: Ms,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let member = self.require_member(member_id).await?;

        // A repeat of a booking the member already holds is a duplicate, whatever the balance.
        let held = self.store.bookings_at(starts_at).await?;
        if held.iter().any(|b| b.unique_key() == Some((member_id, starts_at))) {
            return Err(EngineError::DuplicateBooking);
        }

        if !policy::is_eligible(&member, now) {
            return Err(EngineError::SubscriptionExhausted);
        }
        let (open, close) = policy::booking_window(now, member.expires_at, self.config.horizon_months);
        self.check_grid(starts_at)?;
        if starts_at < open || starts_at >= close {
            return Err(EngineError::InvalidSlot(starts_at));
        }
        self.require_instructor(instructor_id).await?;

        let key = SlotKey::new(instructor_id, starts_at);
        let booking = Booking {
            id: Ulid::new(),
            member_id: Some(member_id),
            instructor_id,
            starts_at,
            created_at: now,
            kind: BookingKind::Simple,
        };

        let mut undo = Compensation::new(self.store.as_ref());
        self.claim_seat(key, member.plan.seat_limit(self.config.slot_capacity))
            .await?;
        undo.push(Undo::ReleaseSeat(key));

        if let Err(e) = self.store.insert_booking(booking.clone()).await {
            return undo.fail(e.into()).await;
        }
        undo.push(Undo::DropBooking(booking.id));

        let remaining = match self.store.consume_access(member_id).await {
            Ok(Some(remaining)) => remaining,
            Ok(None) => return undo.fail(EngineError::SubscriptionExhausted).await,
            Err(e) => return undo.fail(e.into()).await,
        };

        if self.closed_after_claim(key).await {
            self.back_out(booking.id, true).await?;
            return Err(EngineError::SlotUnavailable);
        }

        self.record_audit(Some(member_id), starts_at, AuditKind::Created).await;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "origin" => "member").increment(1);
        info!(
            booking = %booking.id,
            member = %member_id,
            instructor = %instructor_id,
            slot = %format_rfc3339(starts_at),
            remaining,
            "booking created"
        );
        let notice = self.notice_for(&booking).await;
        self.dispatcher.submit(NoticeKind::Created, instructor_id, notice);
        Ok(booking)
    }

    /// Owner or admin cancels a booking. Refunds the credit when far enough ahead.
    pub async fn cancel_booking(
        &self,
        requester: Requester,
        booking_id: Ulid,
    ) -> Result<CancelOutcome, EngineError> {
        let started = Instant::now();
        let result = self.try_cancel_booking(requester, booking_id).await;
        self.observe("cancel_booking", started, &result);
        result
    }

    async fn try_cancel_booking(
        &self,
        requester: Requester,
        booking_id: Ulid,
    ) -> Result<CancelOutcome, EngineError> {
        let booking = self
            .store
            .get_booking(booking_id)
            .await?
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if requester.role != Role::Admin && booking.member_id != Some(requester.id) {
            return Err(EngineError::Forbidden);
        }

        let now = self.clock.now();
        let refund = booking.is_simple()
            && policy::refund_due(booking.starts_at, now, self.config.refund_window_ms);
        let outcome = self.unbook(booking_id, refund).await?;

        self.record_audit(outcome.booking.member_id, outcome.booking.starts_at, AuditKind::Deleted)
            .await;
        metrics::counter!(
            observability::BOOKINGS_CANCELLED_TOTAL,
            "origin" => "member",
            "refunded" => if outcome.refunded { "true" } else { "false" }
        )
        .increment(1);
        info!(
            booking = %booking_id,
            by = %requester.id,
            refunded = outcome.refunded,
            "booking cancelled"
        );
        let notice = self.notice_for(&outcome.booking).await;
        self.dispatcher
            .submit(NoticeKind::Cancelled, outcome.booking.instructor_id, notice);
        Ok(outcome)
    }

    /// Staff reservation. Skips member eligibility and the horizon, keeps every slot check.
    pub async fn admin_create_booking(&self, request: AdminBooking) -> Result<AdminCreated, EngineError> {
        let started = Instant::now();
        let result = self.try_admin_create_booking(request).await;
        self.observe("admin_create_booking", started, &result);
        result
    }

    async fn try_admin_create_booking(&self, request: AdminBooking) -> Result<AdminCreated, EngineError> {
        let AdminBooking {
            member_id,
            instructor_id,
            starts_at,
            kind,
        } = request;
        self.check_grid(starts_at)?;
        self.require_instructor(instructor_id).await?;
        let member = match member_id {
            Some(id) => Some(self.require_member(id).await?),
            None => None,
        };

        let capacity = self.config.slot_capacity;
        let limit = match (&member, kind) {
            (Some(m), BookingKind::Simple) => m.plan.seat_limit(capacity),
            _ => capacity,
        };
        let key = SlotKey::new(instructor_id, starts_at);
        let booking = Booking {
            id: Ulid::new(),
            member_id,
            instructor_id,
            starts_at,
            created_at: self.clock.now(),
            kind,
        };

        let mut undo = Compensation::new(self.store.as_ref());
        self.claim_seat(key, limit).await?;
        undo.push(Undo::ReleaseSeat(key));
        if let Err(e) = self.store.insert_booking(booking.clone()).await {
            return undo.fail(e.into()).await;
        }

        if let (Some(id), BookingKind::Simple) = (member_id, kind) {
            let consumed = match self.store.consume_access(id).await {
                Ok(Some(_)) => true,
                Ok(None) => {
                    warn!(member = %id, "admin booking for a member with no accesses left");
                    false
                }
                Err(e) => {
                    undo.push(Undo::DropBooking(booking.id));
                    return undo.fail(e.into()).await;
                }
            };
            if self.closed_after_claim(key).await {
                self.back_out(booking.id, consumed).await?;
                return Err(EngineError::SlotUnavailable);
            }
        }

        self.record_audit(member_id, starts_at, AuditKind::BookingCreated).await;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "origin" => "admin").increment(1);
        info!(
            booking = %booking.id,
            member = ?member_id,
            instructor = %instructor_id,
            slot = %format_rfc3339(starts_at),
            kind = ?kind,
            "admin booking created"
        );

        let notice_delivered = match member {
            Some(_) => {
                let notice = self.notice_for(&booking).await;
                match self
                    .dispatcher
                    .deliver_now(NoticeKind::Created, instructor_id, &notice)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(booking = %booking.id, "{e}");
                        false
                    }
                }
            }
            None => false,
        };
        Ok(AdminCreated {
            booking,
            notice_delivered,
        })
    }

    /// Staff removal. Refunds only when asked and only SIMPLE bookings; no time window.
    pub async fn admin_delete_booking(&self, booking_id: Ulid, refund: bool) -> Result<CancelOutcome, EngineError> {
        let started = Instant::now();
        let result = self.try_admin_delete_booking(booking_id, refund).await;
        self.observe("admin_delete_booking", started, &result);
        result
    }

    async fn try_admin_delete_booking(&self, booking_id: Ulid, refund: bool) -> Result<CancelOutcome, EngineError> {
        let booking = self
            .store
            .get_booking(booking_id)
            .await?
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let outcome = self
            .unbook(booking_id, refund && booking.is_simple())
            .await?;

        self.record_audit(outcome.booking.member_id, outcome.booking.starts_at, AuditKind::Deleted)
            .await;
        metrics::counter!(
            observability::BOOKINGS_CANCELLED_TOTAL,
            "origin" => "admin",
            "refunded" => if outcome.refunded { "true" } else { "false" }
        )
        .increment(1);
        info!(booking = %booking_id, refunded = outcome.refunded, "admin booking deleted");
        let notice = self.notice_for(&outcome.booking).await;
        self.dispatcher
            .submit(NoticeKind::Cancelled, outcome.booking.instructor_id, notice);
        Ok(outcome)
    }

    /// Remove a booking, free its seat and optionally refund its member, as one unit.
    ///
    /// The refund is skipped (with a warning) when the booking has no member or the
    /// member account no longer exists.
    pub(super) async fn unbook(&self, booking_id: Ulid, refund: bool) -> Result<CancelOutcome, EngineError> {
        let mut undo = Compensation::new(self.store.as_ref());
        let booking = self
            .store
            .remove_booking(booking_id)
            .await?
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        undo.push(Undo::RestoreBooking(booking.clone()));

        let key = booking.slot_key();
        if let Err(e) = self.store.release_seat(key).await {
            return undo.fail(e.into()).await;
        }
        undo.push(Undo::RestoreSeat(key));

        let refunded = match (refund, booking.member_id) {
            (true, Some(member_id)) => match self.store.refund_access(member_id).await {
                Ok(_) => true,
                Err(StoreError::UnknownMember(id)) => {
                    warn!(booking = %booking_id, member = %id, "refund skipped: member account is gone");
                    false
                }
                Err(e) => return undo.fail(e.into()).await,
            },
            _ => false,
        };
        Ok(CancelOutcome { booking, refunded })
    }
}
