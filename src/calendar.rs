use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::model::{HOUR, Ms};

/// The fixed hourly grid members can book on. All comparisons are in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessHours {
    /// First bookable start hour.
    pub open_hour: u32,
    /// Last bookable start hour (inclusive).
    pub close_hour: u32,
    pub closed_weekdays: Vec<Weekday>,
    /// Recurring closures as `(month, day)`.
    pub closed_dates: Vec<(u32, u32)>,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open_hour: 7,
            close_hour: 21,
            closed_weekdays: vec![Weekday::Sun],
            closed_dates: Vec::new(),
        }
    }
}

impl BusinessHours {
    /// True iff `t` is exactly on the grid. Off-grid times are never rounded.
    pub fn is_grid_point(&self, t: Ms) -> bool {
        if t.rem_euclid(HOUR) != 0 {
            return false;
        }
        let Some(dt) = DateTime::<Utc>::from_timestamp_millis(t) else {
            return false;
        };
        let hour = dt.hour();
        hour >= self.open_hour
            && hour <= self.close_hour
            && !self.closed_weekdays.contains(&dt.weekday())
            && !self.closed_dates.contains(&(dt.month(), dt.day()))
    }

    /// Lazily enumerate grid points in `[from, to)`.
    pub fn candidates(&self, from: Ms, to: Ms) -> CandidateSlots<'_> {
        let mut first = from.div_euclid(HOUR) * HOUR;
        if first < from {
            first += HOUR;
        }
        CandidateSlots {
            hours: self,
            next: first,
            end: to,
        }
    }
}

/// Finite, restartable (via `Clone`) sequence of candidate slot starts.
#[derive(Debug, Clone)]
pub struct CandidateSlots<'a> {
    hours: &'a BusinessHours,
    next: Ms,
    end: Ms,
}

impl Iterator for CandidateSlots<'_> {
    type Item = Ms;

    fn next(&mut self) -> Option<Ms> {
        while self.next < self.end {
            let t = self.next;
            self.next += HOUR;
            if self.hours.is_grid_point(t) {
                return Some(t);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2024-01-01 is a Monday.
    fn at(day: u32, hour: u32) -> Ms {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn monday_has_fifteen_slots() {
        let hours = BusinessHours::default();
        let slots: Vec<Ms> = hours.candidates(at(1, 0), at(2, 0)).collect();
        assert_eq!(slots.len(), 15); // 07:00..=21:00
        assert_eq!(slots.first(), Some(&at(1, 7)));
        assert_eq!(slots.last(), Some(&at(1, 21)));
    }

    #[test]
    fn sunday_is_excluded() {
        let hours = BusinessHours::default();
        assert_eq!(hours.candidates(at(7, 0), at(8, 0)).count(), 0);
        assert!(!hours.is_grid_point(at(7, 9)));
        // Saturday is open
        assert!(hours.is_grid_point(at(6, 9)));
    }

    #[test]
    fn week_has_ninety_slots() {
        let hours = BusinessHours::default();
        assert_eq!(hours.candidates(at(1, 0), at(8, 0)).count(), 6 * 15);
    }

    #[test]
    fn range_is_half_open() {
        let hours = BusinessHours::default();
        let slots: Vec<Ms> = hours.candidates(at(1, 9), at(1, 11)).collect();
        assert_eq!(slots, vec![at(1, 9), at(1, 10)]);
    }

    #[test]
    fn from_rounds_up_to_next_hour() {
        let hours = BusinessHours::default();
        let mut it = hours.candidates(at(1, 9) + 1, at(1, 12));
        assert_eq!(it.next(), Some(at(1, 10)));
    }

    #[test]
    fn off_grid_times_are_rejected() {
        let hours = BusinessHours::default();
        assert!(hours.is_grid_point(at(1, 9)));
        assert!(!hours.is_grid_point(at(1, 9) + 30 * 60_000));
        assert!(!hours.is_grid_point(at(1, 9) + 1));
        assert!(!hours.is_grid_point(at(1, 6)));
        assert!(!hours.is_grid_point(at(1, 22)));
    }

    #[test]
    fn closed_dates_are_skipped() {
        let hours = BusinessHours {
            closed_dates: vec![(1, 1)],
            ..BusinessHours::default()
        };
        assert_eq!(hours.candidates(at(1, 0), at(2, 0)).count(), 0);
        assert_eq!(hours.candidates(at(2, 0), at(3, 0)).count(), 15);
    }

    #[test]
    fn sequence_is_restartable() {
        let hours = BusinessHours::default();
        let it = hours.candidates(at(1, 0), at(3, 0));
        let first: Vec<Ms> = it.clone().collect();
        let second: Vec<Ms> = it.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_range() {
        let hours = BusinessHours::default();
        assert_eq!(hours.candidates(at(2, 0), at(1, 0)).count(), 0);
    }
}
