use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Parse a timezone-qualified RFC-3339 timestamp into UTC milliseconds.
pub fn parse_rfc3339(s: &str) -> Option<Ms> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

pub fn format_rfc3339(t: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| t.to_string())
}

/// A slot is identified by instructor and start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub instructor_id: Ulid,
    pub starts_at: Ms,
}

impl SlotKey {
    pub fn new(instructor_id: Ulid, starts_at: Ms) -> Self {
        Self {
            instructor_id,
            starts_at,
        }
    }
}

/// Administrative state of a slot. Owned by the slot, never inferred from bookings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    #[default]
    Free,
    Unavailable,
    Massage,
    Appointment,
}

impl SlotState {
    /// `Free` may move to any blocked state; any state may return to `Free`.
    pub fn can_become(self, next: SlotState) -> bool {
        next == SlotState::Free || self == SlotState::Free
    }

    pub fn label(self) -> &'static str {
        match self {
            SlotState::Free => "FREE",
            SlotState::Unavailable => "UNAVAILABLE",
            SlotState::Massage => "MASSAGE",
            SlotState::Appointment => "APPOINTMENT",
        }
    }
}

/// Result of asking a slot whether one more seat fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Open,
    /// Disabled or not in the `Free` state.
    Closed,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub instructor_id: Ulid,
    pub starts_at: Ms,
    pub people_count: u32,
    pub max_capacity: u32,
    pub state: SlotState,
    pub disabled: bool,
}

impl Slot {
    /// A freshly materialized slot: empty, free, enabled.
    pub fn new(key: SlotKey, max_capacity: u32) -> Self {
        Self {
            instructor_id: key.instructor_id,
            starts_at: key.starts_at,
            people_count: 0,
            max_capacity,
            state: SlotState::Free,
            disabled: false,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.instructor_id, self.starts_at)
    }

    /// Whether one more seat fits, with capacity optionally tightened to `limit`.
    pub fn occupancy(&self, limit: u32) -> Occupancy {
        if self.disabled || self.state != SlotState::Free {
            Occupancy::Closed
        } else if self.people_count >= self.max_capacity.min(limit) {
            Occupancy::Full
        } else {
            Occupancy::Open
        }
    }

    /// True when the slot still has its materialization defaults.
    pub fn is_pristine(&self) -> bool {
        self.people_count == 0 && self.state == SlotState::Free && !self.disabled
    }
}

/// What kind of reservation a booking holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingKind {
    /// Member-initiated: consumes a seat and an access credit.
    Simple,
    /// Studio-blocked reservations made by staff.
    Massage,
    Appointment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// `None` for staff reservations not tied to a member.
    pub member_id: Option<Ulid>,
    pub instructor_id: Ulid,
    pub starts_at: Ms,
    pub created_at: Ms,
    pub kind: BookingKind,
}

impl Booking {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.instructor_id, self.starts_at)
    }

    pub fn is_simple(&self) -> bool {
        self.kind == BookingKind::Simple
    }

    /// Key of the `(member, startsAt)` uniqueness index, if this booking is subject to it.
    pub fn unique_key(&self) -> Option<(Ulid, Ms)> {
        match (self.kind, self.member_id) {
            (BookingKind::Simple, Some(member_id)) => Some((member_id, self.starts_at)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanKind {
    /// Never shares a slot with another member.
    Single,
    Shared,
}

impl PlanKind {
    /// Seats this plan may fill up to in a slot of capacity `capacity`.
    pub fn seat_limit(self, capacity: u32) -> u32 {
        match self {
            PlanKind::Single => 1,
            PlanKind::Shared => capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAccount {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub remaining_accesses: u32,
    pub expires_at: Ms,
    pub plan: PlanKind,
}

impl MemberAccount {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructor {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: String,
}

impl Instructor {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    Created,
    Deleted,
    BookingCreated,
    SlotDisabled,
    SlotEnabled,
    SlotMassage,
    SlotAppointment,
    SlotUnreserved,
}

impl AuditKind {
    pub fn label(self) -> &'static str {
        match self {
            AuditKind::Created => "CREATED",
            AuditKind::Deleted => "DELETED",
            AuditKind::BookingCreated => "BOOKING_CREATED",
            AuditKind::SlotDisabled => "SLOT_DISABLED",
            AuditKind::SlotEnabled => "SLOT_ENABLED",
            AuditKind::SlotMassage => "SLOT_MASSAGE",
            AuditKind::SlotAppointment => "SLOT_APPOINTMENT",
            AuditKind::SlotUnreserved => "SLOT_UNRESERVED",
        }
    }

    /// Audit kind recorded when a slot moves `from` → `to`.
    pub fn for_transition(from: SlotState, to: SlotState) -> Self {
        match (from, to) {
            (SlotState::Massage | SlotState::Appointment, SlotState::Free) => AuditKind::SlotUnreserved,
            (_, SlotState::Free) => AuditKind::SlotEnabled,
            (_, SlotState::Unavailable) => AuditKind::SlotDisabled,
            (_, SlotState::Massage) => AuditKind::SlotMassage,
            (_, SlotState::Appointment) => AuditKind::SlotAppointment,
        }
    }
}

/// Immutable audit record of a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub member_id: Option<Ulid>,
    pub starts_at: Ms,
    pub kind: AuditKind,
    pub occurred_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Admin,
}

/// Who is asking for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub id: Ulid,
    pub role: Role,
}

impl Requester {
    pub fn member(id: Ulid) -> Self {
        Self { id, role: Role::Member }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }
}

/// Which instructors a bulk slot operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotScope {
    All,
    Instructor(Ulid),
}

impl SlotScope {
    pub fn includes(&self, instructor_id: Ulid) -> bool {
        match self {
            SlotScope::All => true,
            SlotScope::Instructor(id) => *id == instructor_id,
        }
    }
}
