mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

/// Outcome of a conditional seat increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatClaim {
    Claimed(Slot),
    /// Disabled or not `Free`; nothing changed.
    Unavailable(Slot),
    /// At capacity (or at the caller's tighter limit); nothing changed.
    Full(Slot),
}

/// Counts removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub slots: usize,
    pub audit_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// I/O failure or the log writer is gone. Safe to retry.
    Unavailable(String),
    /// A SIMPLE booking already holds `(member, startsAt)`.
    DuplicateBooking,
    UnknownMember(Ulid),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::DuplicateBooking => write!(f, "duplicate booking"),
            StoreError::UnknownMember(id) => write!(f, "unknown member: {id}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// One durable mutation. Replaying the log in order rebuilds the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    InstructorUpserted { instructor: Instructor },
    MemberUpserted { member: MemberAccount },
    AccessConsumed { member_id: Ulid },
    AccessRefunded { member_id: Ulid },
    SeatClaimed { key: SlotKey },
    SeatReleased { key: SlotKey },
    SlotStateChanged { key: SlotKey, state: SlotState, disabled: bool },
    /// Full slot image, written by compaction.
    SlotRestored { slot: Slot },
    BookingInserted { booking: Booking },
    BookingDeleted { id: Ulid },
    AuditAppended { entry: AuditEntry },
    Pruned { slot_cutoff: Ms, audit_cutoff: Ms },
}

/// Persistence contract of the lifecycle engine.
///
/// Each method is atomic for the entity it touches. Nothing here spans entities;
/// the engine composes these calls and compensates on partial failure.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_instructor(&self, id: Ulid) -> Result<Option<Instructor>, StoreError>;
    async fn list_instructors(&self) -> Result<Vec<Instructor>, StoreError>;
    async fn put_instructor(&self, instructor: Instructor) -> Result<(), StoreError>;

    async fn get_member(&self, id: Ulid) -> Result<Option<MemberAccount>, StoreError>;
    async fn put_member(&self, member: MemberAccount) -> Result<(), StoreError>;
    /// Decrement iff positive. `None` when the balance was already zero.
    async fn consume_access(&self, id: Ulid) -> Result<Option<u32>, StoreError>;
    async fn refund_access(&self, id: Ulid) -> Result<u32, StoreError>;

    /// Existing slot, or a fresh `Free` one. Idempotent.
    async fn get_or_create_slot(&self, key: SlotKey) -> Result<Slot, StoreError>;
    /// Increment `peopleCount` iff the slot is open and below `min(maxCapacity, limit)`.
    async fn claim_seat(&self, key: SlotKey, limit: u32) -> Result<SeatClaim, StoreError>;
    /// Decrement `peopleCount`, floored at zero.
    async fn release_seat(&self, key: SlotKey) -> Result<Slot, StoreError>;
    /// Unconditional increment, for undoing a release.
    async fn restore_seat(&self, key: SlotKey) -> Result<Slot, StoreError>;
    async fn set_slot_state(&self, key: SlotKey, state: SlotState, disabled: bool) -> Result<Slot, StoreError>;
    /// Materialized slots of one instructor in `[from, to)`, read under a single lock.
    async fn slots_in_range(&self, instructor_id: Ulid, from: Ms, to: Ms) -> Result<Vec<Slot>, StoreError>;
    async fn slots_at(&self, starts_at: Ms) -> Result<Vec<Slot>, StoreError>;

    /// Fails with `DuplicateBooking` if the `(member, startsAt)` index entry is taken.
    async fn insert_booking(&self, booking: Booking) -> Result<(), StoreError>;
    /// `None` if absent or already removed by someone else.
    async fn remove_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
    async fn bookings_at(&self, starts_at: Ms) -> Result<Vec<Booking>, StoreError>;
    async fn bookings_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError>;
    async fn member_bookings(&self, member_id: Ulid, since: Ms) -> Result<Vec<Booking>, StoreError>;

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;
    /// Most recent first.
    async fn audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError>;

    async fn compact(&self) -> Result<(), StoreError>;
    async fn appends_since_compact(&self) -> u64;
    /// Drop slots starting before `slot_cutoff` and audit entries before `audit_cutoff`.
    async fn prune(&self, slot_cutoff: Ms, audit_cutoff: Ms) -> Result<PruneReport, StoreError>;
}
