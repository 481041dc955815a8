use chrono::{DateTime, Datelike, TimeZone, Utc};
use ulid::Ulid;

use crate::limits::{DEFAULT_AUDIT_LIMIT, MAX_QUERY_WINDOW_MS};
use crate::model::*;

use super::availability::open_starts;
use super::{Engine, EngineError, policy};

fn check_window(from: Ms, to: Ms) -> Result<(), EngineError> {
    if to.checked_sub(from).is_none_or(|span| span > MAX_QUERY_WINDOW_MS) {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Midnight UTC on the first of `t`'s month.
fn month_start(t: Ms) -> Ms {
    DateTime::<Utc>::from_timestamp_millis(t)
        .and_then(|dt| Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0).single())
        .map_or(t, |dt| dt.timestamp_millis())
}

impl Engine {
    /// Bookable start times with `instructor_id` in `[from, to)`.
    ///
    /// The range never starts in the past. With a member, it is also cut to that
    /// member's booking window and SINGLE plans only see empty slots.
    pub async fn available_slots(
        &self,
        instructor_id: Ulid,
        from: Ms,
        to: Ms,
        member_id: Option<Ulid>,
    ) -> Result<Vec<Ms>, EngineError> {
        self.require_instructor(instructor_id).await?;
        let now = self.clock.now();
        let capacity = self.config.slot_capacity;
        let (from, to, limit) = match member_id {
            Some(id) => {
                let member = self.require_member(id).await?;
                let (open, close) =
                    policy::booking_window(now, member.expires_at, self.config.horizon_months);
                (from.max(open), to.min(close), member.plan.seat_limit(capacity))
            }
            None => (from.max(now), to, capacity),
        };
        if to <= from {
            return Ok(Vec::new());
        }
        check_window(from, to)?;

        let slots = self.store.slots_in_range(instructor_id, from, to).await?;
        Ok(open_starts(&self.config.hours, from, to, &slots, limit))
    }

    /// The member's bookings from the start of the current month on, newest first.
    pub async fn member_bookings(&self, member_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.require_member(member_id).await?;
        let since = month_start(self.clock.now());
        Ok(self.store.member_bookings(member_id, since).await?)
    }

    /// Admin calendar: bookings in `[from, to)`, optionally for one instructor.
    pub async fn bookings_between(&self, from: Ms, to: Ms, scope: SlotScope) -> Result<Vec<Booking>, EngineError> {
        check_window(from, to)?;
        let mut bookings = self.store.bookings_between(from, to).await?;
        bookings.retain(|b| scope.includes(b.instructor_id));
        Ok(bookings)
    }

    /// Admin calendar: every materialized slot in `[from, to)`, by instructor then time.
    pub async fn slots_between(&self, from: Ms, to: Ms) -> Result<Vec<Slot>, EngineError> {
        check_window(from, to)?;
        let mut slots = Vec::new();
        for instructor in self.store.list_instructors().await? {
            slots.extend(self.store.slots_in_range(instructor.id, from, to).await?);
        }
        Ok(slots)
    }

    /// Latest audit entries, newest first.
    pub async fn recent_audit(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self
            .store
            .audit_entries(limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_start_truncates() {
        let t = Utc.with_ymd_and_hms(2024, 3, 17, 15, 30, 0).unwrap().timestamp_millis();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(month_start(t), expected);
        assert_eq!(month_start(expected), expected);
    }

    #[test]
    fn window_cap() {
        assert!(check_window(0, MAX_QUERY_WINDOW_MS).is_ok());
        assert!(matches!(
            check_window(0, MAX_QUERY_WINDOW_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            check_window(i64::MIN, 0),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            check_window(i64::MAX, i64::MIN),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
