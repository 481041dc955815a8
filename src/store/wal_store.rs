use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{BookingStore, PruneReport, SeatClaim, StoreError, StoreEvent};

// ── Group-commit WAL channel ─────────────────────────────

type Reply = oneshot::Sender<io::Result<()>>;

enum WalCommand {
    Append {
        event: StoreEvent,
        response: Reply,
    },
    Compact {
        events: Vec<StoreEvent>,
        response: Reply,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Drains every append already queued behind the first one and
/// commits them with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(StoreEvent, Reply)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so its bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Per-instructor schedule ──────────────────────────────

/// Every materialized slot of one instructor. Its lock is the unit of capacity atomicity.
#[derive(Debug, Default)]
struct Schedule {
    slots: BTreeMap<Ms, Slot>,
}

impl Schedule {
    fn slot_mut(&mut self, key: SlotKey, capacity: u32) -> &mut Slot {
        self.slots
            .entry(key.starts_at)
            .or_insert_with(|| Slot::new(key, capacity))
    }

    fn apply(&mut self, event: &StoreEvent, capacity: u32) {
        match event {
            StoreEvent::SeatClaimed { key } => self.slot_mut(*key, capacity).people_count += 1,
            StoreEvent::SeatReleased { key } => {
                let slot = self.slot_mut(*key, capacity);
                slot.people_count = slot.people_count.saturating_sub(1);
            }
            StoreEvent::SlotStateChanged { key, state, disabled } => {
                let slot = self.slot_mut(*key, capacity);
                slot.state = *state;
                slot.disabled = *disabled;
            }
            StoreEvent::SlotRestored { slot } => {
                self.slots.insert(slot.starts_at, slot.clone());
            }
            _ => {}
        }
    }

    /// Drop slots starting before `cutoff`; returns how many went.
    fn prune(&mut self, cutoff: Ms) -> usize {
        let before = self.slots.len();
        self.slots = self.slots.split_off(&cutoff);
        before - self.slots.len()
    }
}

fn slot_event_instructor(event: &StoreEvent) -> Option<Ulid> {
    match event {
        StoreEvent::SeatClaimed { key }
        | StoreEvent::SeatReleased { key }
        | StoreEvent::SlotStateChanged { key, .. } => Some(key.instructor_id),
        StoreEvent::SlotRestored { slot } => Some(slot.instructor_id),
        _ => None,
    }
}

type SharedSchedule = Arc<RwLock<Schedule>>;
type SharedAccount = Arc<RwLock<MemberAccount>>;

/// In-memory store made durable by a group-committed write-ahead log.
///
/// Every mutation appends its event first and applies it only once the append is
/// synced, while still holding the owning entity's write lock.
pub struct WalStore {
    slot_capacity: u32,
    schedules: DashMap<Ulid, SharedSchedule>,
    instructors: DashMap<Ulid, Instructor>,
    members: DashMap<Ulid, SharedAccount>,
    bookings: DashMap<Ulid, Booking>,
    /// `(member, startsAt)` → booking id, SIMPLE bookings only.
    member_index: DashMap<(Ulid, Ms), Ulid>,
    by_time: DashMap<Ms, Vec<Ulid>>,
    audit: RwLock<Vec<AuditEntry>>,
    /// Mutations hold it shared; compaction holds it exclusively so no event slips
    /// between the snapshot and the file swap.
    gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay the log at `path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(path: &Path, slot_capacity: u32) -> io::Result<Self> {
        let events: Vec<StoreEvent> = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = Self {
            slot_capacity,
            schedules: DashMap::new(),
            instructors: DashMap::new(),
            members: DashMap::new(),
            bookings: DashMap::new(),
            member_index: DashMap::new(),
            by_time: DashMap::new(),
            audit: RwLock::new(Vec::new()),
            gate: RwLock::new(()),
            wal_tx,
        };

        let mut schedules: HashMap<Ulid, Schedule> = HashMap::new();
        let mut members: HashMap<Ulid, MemberAccount> = HashMap::new();
        let mut audit: Vec<AuditEntry> = Vec::new();

        for event in &events {
            match event {
                StoreEvent::InstructorUpserted { instructor } => {
                    store.instructors.insert(instructor.id, instructor.clone());
                }
                StoreEvent::MemberUpserted { member } => {
                    members.insert(member.id, member.clone());
                }
                StoreEvent::AccessConsumed { member_id } => {
                    if let Some(m) = members.get_mut(member_id) {
                        m.remaining_accesses = m.remaining_accesses.saturating_sub(1);
                    }
                }
                StoreEvent::AccessRefunded { member_id } => {
                    if let Some(m) = members.get_mut(member_id) {
                        m.remaining_accesses += 1;
                    }
                }
                StoreEvent::BookingInserted { booking } => store.index_booking(booking.clone()),
                StoreEvent::BookingDeleted { id } => {
                    store.unindex_booking(*id);
                }
                StoreEvent::AuditAppended { entry } => audit.push(entry.clone()),
                StoreEvent::Pruned { slot_cutoff, audit_cutoff } => {
                    for schedule in schedules.values_mut() {
                        schedule.prune(*slot_cutoff);
                    }
                    audit.retain(|e| e.starts_at >= *audit_cutoff);
                }
                other => {
                    if let Some(instructor_id) = slot_event_instructor(other) {
                        schedules
                            .entry(instructor_id)
                            .or_default()
                            .apply(other, slot_capacity);
                    }
                }
            }
        }

        store.schedules = schedules
            .into_iter()
            .map(|(id, s)| (id, Arc::new(RwLock::new(s))))
            .collect();
        store.members = members
            .into_iter()
            .map(|(id, m)| (id, Arc::new(RwLock::new(m))))
            .collect();
        store.audit = RwLock::new(audit);

        tracing::debug!(
            path = %path.display(),
            events = events.len(),
            bookings = store.bookings.len(),
            "store replayed"
        );
        Ok(store)
    }

    /// Write an event through the group-commit writer and wait for the fsync.
    async fn wal_append(&self, event: StoreEvent) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn persist_and_apply(&self, schedule: &mut Schedule, event: StoreEvent) -> Result<(), StoreError> {
        self.wal_append(event.clone()).await?;
        schedule.apply(&event, self.slot_capacity);
        Ok(())
    }

    fn schedule(&self, instructor_id: Ulid) -> SharedSchedule {
        self.schedules.entry(instructor_id).or_default().clone()
    }

    fn all_schedules(&self) -> Vec<SharedSchedule> {
        self.schedules.iter().map(|e| e.value().clone()).collect()
    }

    fn account(&self, id: Ulid) -> Option<SharedAccount> {
        self.members.get(&id).map(|e| e.value().clone())
    }

    fn index_booking(&self, booking: Booking) {
        if let Some(key) = booking.unique_key() {
            self.member_index.insert(key, booking.id);
        }
        self.by_time.entry(booking.starts_at).or_default().push(booking.id);
        self.bookings.insert(booking.id, booking);
    }

    fn unindex_booking(&self, id: Ulid) -> Option<Booking> {
        let (_, booking) = self.bookings.remove(&id)?;
        self.drop_secondary_indexes(&booking);
        Some(booking)
    }

    fn drop_secondary_indexes(&self, booking: &Booking) {
        if let Some(key) = booking.unique_key() {
            self.member_index.remove_if(&key, |_, owner| *owner == booking.id);
        }
        if let Some(mut ids) = self.by_time.get_mut(&booking.starts_at) {
            ids.retain(|b| *b != booking.id);
        }
        self.by_time.remove_if(&booking.starts_at, |_, ids| ids.is_empty());
    }

    fn sorted(mut bookings: Vec<Booking>) -> Vec<Booking> {
        bookings.sort_by_key(|b| (b.starts_at, b.created_at, b.id));
        bookings
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn get_instructor(&self, id: Ulid) -> Result<Option<Instructor>, StoreError> {
        Ok(self.instructors.get(&id).map(|e| e.value().clone()))
    }

    async fn list_instructors(&self) -> Result<Vec<Instructor>, StoreError> {
        let mut all: Vec<Instructor> = self.instructors.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|i| i.id);
        Ok(all)
    }

    async fn put_instructor(&self, instructor: Instructor) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        self.wal_append(StoreEvent::InstructorUpserted { instructor: instructor.clone() })
            .await?;
        self.instructors.insert(instructor.id, instructor);
        Ok(())
    }

    async fn get_member(&self, id: Ulid) -> Result<Option<MemberAccount>, StoreError> {
        match self.account(id) {
            Some(account) => Ok(Some(account.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn put_member(&self, member: MemberAccount) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        self.wal_append(StoreEvent::MemberUpserted { member: member.clone() })
            .await?;
        match self.account(member.id) {
            Some(account) => *account.write().await = member,
            None => {
                self.members.insert(member.id, Arc::new(RwLock::new(member)));
            }
        }
        Ok(())
    }

    async fn consume_access(&self, id: Ulid) -> Result<Option<u32>, StoreError> {
        let _gate = self.gate.read().await;
        let account = self.account(id).ok_or(StoreError::UnknownMember(id))?;
        let mut guard = account.write().await;
        if guard.remaining_accesses == 0 {
            return Ok(None);
        }
        self.wal_append(StoreEvent::AccessConsumed { member_id: id }).await?;
        guard.remaining_accesses -= 1;
        Ok(Some(guard.remaining_accesses))
    }

    async fn refund_access(&self, id: Ulid) -> Result<u32, StoreError> {
        let _gate = self.gate.read().await;
        let account = self.account(id).ok_or(StoreError::UnknownMember(id))?;
        let mut guard = account.write().await;
        self.wal_append(StoreEvent::AccessRefunded { member_id: id }).await?;
        guard.remaining_accesses += 1;
        Ok(guard.remaining_accesses)
    }

    async fn get_or_create_slot(&self, key: SlotKey) -> Result<Slot, StoreError> {
        let schedule = self.schedule(key.instructor_id);
        let mut guard = schedule.write().await;
        Ok(guard.slot_mut(key, self.slot_capacity).clone())
    }

    async fn claim_seat(&self, key: SlotKey, limit: u32) -> Result<SeatClaim, StoreError> {
        let _gate = self.gate.read().await;
        let schedule = self.schedule(key.instructor_id);
        let mut guard = schedule.write().await;
        let slot = guard.slot_mut(key, self.slot_capacity).clone();
        match slot.occupancy(limit) {
            Occupancy::Closed => return Ok(SeatClaim::Unavailable(slot)),
            Occupancy::Full => return Ok(SeatClaim::Full(slot)),
            Occupancy::Open => {}
        }
        self.persist_and_apply(&mut guard, StoreEvent::SeatClaimed { key })
            .await?;
        Ok(SeatClaim::Claimed(guard.slot_mut(key, self.slot_capacity).clone()))
    }

    async fn release_seat(&self, key: SlotKey) -> Result<Slot, StoreError> {
        let _gate = self.gate.read().await;
        let schedule = self.schedule(key.instructor_id);
        let mut guard = schedule.write().await;
        if guard.slot_mut(key, self.slot_capacity).people_count > 0 {
            self.persist_and_apply(&mut guard, StoreEvent::SeatReleased { key })
                .await?;
        }
        Ok(guard.slot_mut(key, self.slot_capacity).clone())
    }

    async fn restore_seat(&self, key: SlotKey) -> Result<Slot, StoreError> {
        let _gate = self.gate.read().await;
        let schedule = self.schedule(key.instructor_id);
        let mut guard = schedule.write().await;
        self.persist_and_apply(&mut guard, StoreEvent::SeatClaimed { key })
            .await?;
        Ok(guard.slot_mut(key, self.slot_capacity).clone())
    }

    async fn set_slot_state(&self, key: SlotKey, state: SlotState, disabled: bool) -> Result<Slot, StoreError> {
        let _gate = self.gate.read().await;
        let schedule = self.schedule(key.instructor_id);
        let mut guard = schedule.write().await;
        self.persist_and_apply(&mut guard, StoreEvent::SlotStateChanged { key, state, disabled })
            .await?;
        Ok(guard.slot_mut(key, self.slot_capacity).clone())
    }

    async fn slots_in_range(&self, instructor_id: Ulid, from: Ms, to: Ms) -> Result<Vec<Slot>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let Some(schedule) = self.schedules.get(&instructor_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = schedule.read().await;
        Ok(guard.slots.range(from..to).map(|(_, s)| s.clone()).collect())
    }

    async fn slots_at(&self, starts_at: Ms) -> Result<Vec<Slot>, StoreError> {
        let mut slots = Vec::new();
        for schedule in self.all_schedules() {
            if let Some(slot) = schedule.read().await.slots.get(&starts_at) {
                slots.push(slot.clone());
            }
        }
        slots.sort_by_key(|s| s.instructor_id);
        Ok(slots)
    }

    async fn insert_booking(&self, booking: Booking) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        if let Some(key) = booking.unique_key() {
            match self.member_index.entry(key) {
                Entry::Occupied(_) => return Err(StoreError::DuplicateBooking),
                Entry::Vacant(slot) => {
                    slot.insert(booking.id);
                }
            }
        }
        if let Err(e) = self
            .wal_append(StoreEvent::BookingInserted { booking: booking.clone() })
            .await
        {
            if let Some(key) = booking.unique_key() {
                self.member_index.remove_if(&key, |_, owner| *owner == booking.id);
            }
            return Err(e);
        }
        self.by_time.entry(booking.starts_at).or_default().push(booking.id);
        self.bookings.insert(booking.id, booking);
        Ok(())
    }

    async fn remove_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        let _gate = self.gate.read().await;
        // Taking it out of the map first makes concurrent removers race on the map, not the log.
        let Some((_, booking)) = self.bookings.remove(&id) else {
            return Ok(None);
        };
        if let Err(e) = self.wal_append(StoreEvent::BookingDeleted { id }).await {
            self.bookings.insert(id, booking);
            return Err(e);
        }
        self.drop_secondary_indexes(&booking);
        Ok(Some(booking))
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|e| e.value().clone()))
    }

    async fn bookings_at(&self, starts_at: Ms) -> Result<Vec<Booking>, StoreError> {
        let ids: Vec<Ulid> = self
            .by_time
            .get(&starts_at)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let found = ids
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|e| e.value().clone()))
            .collect();
        Ok(Self::sorted(found))
    }

    async fn bookings_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError> {
        let found = self
            .bookings
            .iter()
            .filter(|e| e.starts_at >= from && e.starts_at < to)
            .map(|e| e.value().clone())
            .collect();
        Ok(Self::sorted(found))
    }

    async fn member_bookings(&self, member_id: Ulid, since: Ms) -> Result<Vec<Booking>, StoreError> {
        let found = self
            .bookings
            .iter()
            .filter(|e| e.member_id == Some(member_id) && e.starts_at >= since)
            .map(|e| e.value().clone())
            .collect();
        let mut sorted = Self::sorted(found);
        sorted.reverse();
        Ok(sorted)
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        self.wal_append(StoreEvent::AuditAppended { entry: entry.clone() })
            .await?;
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let audit = self.audit.read().await;
        Ok(audit.iter().rev().take(limit).cloned().collect())
    }

    async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;
        let mut events: Vec<StoreEvent> = self
            .instructors
            .iter()
            .map(|e| StoreEvent::InstructorUpserted { instructor: e.value().clone() })
            .collect();

        let accounts: Vec<SharedAccount> = self.members.iter().map(|e| e.value().clone()).collect();
        for account in accounts {
            events.push(StoreEvent::MemberUpserted { member: account.read().await.clone() });
        }

        for schedule in self.all_schedules() {
            let guard = schedule.read().await;
            events.extend(
                guard
                    .slots
                    .values()
                    .filter(|s| !s.is_pristine())
                    .map(|s| StoreEvent::SlotRestored { slot: s.clone() }),
            );
        }

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| StoreEvent::BookingInserted { booking }));

        events.extend(
            self.audit
                .read()
                .await
                .iter()
                .map(|entry| StoreEvent::AuditAppended { entry: entry.clone() }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tracing::debug!(events = count, "wal compacted");
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn prune(&self, slot_cutoff: Ms, audit_cutoff: Ms) -> Result<PruneReport, StoreError> {
        let _gate = self.gate.read().await;
        self.wal_append(StoreEvent::Pruned { slot_cutoff, audit_cutoff }).await?;
        let mut report = PruneReport::default();
        for schedule in self.all_schedules() {
            report.slots += schedule.write().await.prune(slot_cutoff);
        }
        let mut audit = self.audit.write().await;
        let before = audit.len();
        audit.retain(|e| e.starts_at >= audit_cutoff);
        report.audit_entries = before - audit.len();
        Ok(report)
    }
}
