//! Pure booking rules. No I/O, no clock reads: `now` is always passed in.

use chrono::{DateTime, Months, Utc};

use crate::model::{MemberAccount, Ms};

/// A member may book while the plan is unexpired and has credits left.
pub fn is_eligible(member: &MemberAccount, now: Ms) -> bool {
    now <= member.expires_at && member.remaining_accesses > 0
}

/// `t` plus whole calendar months, clamping to month end (Jan 31 + 1 → Feb 29).
pub fn add_months(t: Ms, months: u32) -> Ms {
    DateTime::<Utc>::from_timestamp_millis(t)
        .and_then(|dt| dt.checked_add_months(Months::new(months)))
        .map_or(Ms::MAX, |dt| dt.timestamp_millis())
}

/// Half-open `[now, end)` in which a member may place a booking.
pub fn booking_window(now: Ms, expires_at: Ms, horizon_months: u32) -> (Ms, Ms) {
    (now, add_months(now, horizon_months).min(expires_at))
}

/// Cancelling at least `window` before the start refunds the credit. Hard cutoff.
pub fn refund_due(starts_at: Ms, now: Ms, window: Ms) -> bool {
    starts_at - now >= window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> Ms {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp_millis()
    }

    fn account(remaining: u32, expires_at: Ms) -> MemberAccount {
        MemberAccount {
            id: Ulid::new(),
            first_name: "Luca".into(),
            last_name: "Neri".into(),
            email: "luca@example.com".into(),
            remaining_accesses: remaining,
            expires_at,
            plan: PlanKind::Shared,
        }
    }

    #[test]
    fn eligibility() {
        let now = ts(2024, 1, 10, 8);
        assert!(is_eligible(&account(1, now), now));
        assert!(!is_eligible(&account(0, now + DAY), now));
        assert!(!is_eligible(&account(5, now - 1), now));
    }

    #[test]
    fn months_clamp_to_month_end() {
        assert_eq!(add_months(ts(2024, 1, 31, 9), 1), ts(2024, 2, 29, 9));
        assert_eq!(add_months(ts(2024, 1, 15, 9), 1), ts(2024, 2, 15, 9));
    }

    #[test]
    fn window_is_bounded_by_expiry() {
        let now = ts(2024, 1, 1, 6);
        assert_eq!(booking_window(now, ts(2024, 6, 1, 0), 1), (now, ts(2024, 2, 1, 6)));
        assert_eq!(booking_window(now, ts(2024, 1, 10, 0), 1), (now, ts(2024, 1, 10, 0)));
    }

    #[test]
    fn refund_cutoff_is_inclusive_at_the_window() {
        let start = ts(2024, 1, 2, 12);
        assert!(refund_due(start, start - 3 * HOUR, 3 * HOUR));
        assert!(refund_due(start, start - 3 * HOUR - 1_000, 3 * HOUR));
        assert!(!refund_due(start, start - 3 * HOUR + 1_000, 3 * HOUR));
        assert!(!refund_due(start, start + HOUR, 3 * HOUR));
    }
}
