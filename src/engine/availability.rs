use crate::calendar::BusinessHours;
use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Grid points in `[from, to)` that can still take one more seat under `limit`.
///
/// `slots` is a snapshot of the instructor's materialized slots in the same range,
/// sorted by `starts_at`. A grid point with no slot has never been touched and is open.
/// The result is advisory; `claim_seat` re-checks at commit time.
pub fn open_starts(hours: &BusinessHours, from: Ms, to: Ms, slots: &[Slot], limit: u32) -> Vec<Ms> {
    let mut materialized = slots.iter().peekable();
    let mut open = Vec::new();

    for t in hours.candidates(from, to) {
        while materialized.next_if(|s| s.starts_at < t).is_some() {}
        let occupancy = match materialized.peek() {
            Some(slot) if slot.starts_at == t => slot.occupancy(limit),
            _ => Occupancy::Open,
        };
        if occupancy == Occupancy::Open {
            open.push(t);
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    // 2024-01-01 is a Monday.
    fn at(day: u32, hour: u32) -> Ms {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn slot(instructor: Ulid, t: Ms, people: u32, state: SlotState, disabled: bool) -> Slot {
        Slot {
            people_count: people,
            state,
            disabled,
            ..Slot::new(SlotKey::new(instructor, t), 2)
        }
    }

    #[test]
    fn untouched_day_is_fully_open() {
        let hours = BusinessHours::default();
        assert_eq!(open_starts(&hours, at(1, 0), at(2, 0), &[], 2).len(), 15);
    }

    #[test]
    fn blocked_and_full_slots_are_excluded() {
        let hours = BusinessHours::default();
        let i = Ulid::new();
        let slots = vec![
            slot(i, at(1, 7), 2, SlotState::Free, false),
            slot(i, at(1, 8), 0, SlotState::Massage, false),
            slot(i, at(1, 9), 0, SlotState::Free, true),
            slot(i, at(1, 10), 1, SlotState::Free, false),
        ];
        let open = open_starts(&hours, at(1, 7), at(1, 12), &slots, 2);
        assert_eq!(open, vec![at(1, 10), at(1, 11)]);
    }

    #[test]
    fn single_plan_sees_partly_filled_slots_as_taken() {
        let hours = BusinessHours::default();
        let i = Ulid::new();
        let slots = vec![slot(i, at(1, 10), 1, SlotState::Free, false)];
        let open = open_starts(&hours, at(1, 9), at(1, 12), &slots, PlanKind::Single.seat_limit(2));
        assert_eq!(open, vec![at(1, 9), at(1, 11)]);
    }

    #[test]
    fn off_grid_slots_never_leak_in() {
        let hours = BusinessHours::default();
        let i = Ulid::new();
        // a Sunday slot (e.g. left behind by a closure change) is not offered
        let slots = vec![slot(i, at(7, 9), 0, SlotState::Free, false)];
        assert!(open_starts(&hours, at(7, 0), at(8, 0), &slots, 2).is_empty());
    }
}
