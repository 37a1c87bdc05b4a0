mod error;
mod ledger;
mod occupancy;
mod queries;
mod registry;
mod reservation;
mod sync;

pub use error::EngineError;
pub use occupancy::{desired_flag, effective_capacity, is_full, listing, occupancy, open_for_date};
pub use registry::{parse_capacity_input, Schedule};
pub use reservation::parse_vehicle;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveTime;
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::observability::SLOT_LOCK_WAIT_SECONDS;
use crate::wal::{Wal, WalHandle};

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// In-memory slot registry and booking ledger, backed by the journal.
///
/// Each slot sits behind its own `RwLock`; the write guard is the per-slot
/// reservation lock. Bookings live inside the state of the slot they
/// reference, so anything holding that guard sees an exact occupancy count.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    /// `(start, end)` → slot id. Keeps windows unique without a global lock.
    pub(super) windows: DashMap<(NaiveTime, NaiveTime), Ulid>,
    /// Reverse lookup: booking id → id of the slot holding it.
    pub(super) booking_to_slot: DashMap<Ulid, Ulid>,
    /// Bookings that reference no slot (legacy rows, or their slot was deleted).
    pub(super) detached: DashMap<Ulid, Booking>,
    /// Serializes mutations of `detached`.
    pub(super) detached_lock: Mutex<()>,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot cannot miss an append.
    pub(super) gate: RwLock<()>,
    pub(super) wal: WalHandle,
}

/// Apply a slot-scoped event. The caller holds the slot's write lock.
fn apply_to_slot(slot: &mut SlotState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SlotCapacityUpdated { capacity, .. } => {
            slot.capacity = StoredCapacity::from(*capacity);
        }
        Event::SlotAvailabilitySet { is_available, .. } => {
            slot.is_available = *is_available;
        }
        Event::BookingReserved {
            booking,
            saturates_slot,
        } => {
            booking_index.insert(booking.id, slot.id);
            slot.insert_booking(booking.clone());
            if *saturates_slot {
                slot.is_available = false;
            }
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = slot.booking_mut(id) {
                b.status = *status;
            }
        }
        Event::BookingArchived { id, side, mark, .. } => {
            if let Some(b) = slot.booking_mut(id) {
                b.set_archive_mark(*side, mark.clone());
            }
        }
        // Creation and deletion change the registry itself, not one slot.
        Event::SlotCreated { .. } | Event::SlotDeleted { .. } => {}
    }
}

/// Apply a booking event for a booking that references no slot.
fn apply_detached(detached: &DashMap<Ulid, Booking>, event: &Event) {
    match event {
        Event::BookingReserved { booking, .. } => {
            detached.insert(booking.id, booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(mut b) = detached.get_mut(id) {
                b.status = *status;
            }
        }
        Event::BookingArchived { id, side, mark, .. } => {
            if let Some(mut b) = detached.get_mut(id) {
                b.set_archive_mark(*side, mark.clone());
            }
        }
        _ => {}
    }
}

/// Mark a slot deleted and move its bookings to the detached ledger.
fn retire_slot(slot: &mut SlotState, booking_index: &DashMap<Ulid, Ulid>, detached: &DashMap<Ulid, Booking>) {
    slot.retired = true;
    // Detach before unindexing so the id is always visible in one of the two.
    for mut booking in slot.bookings.drain(..) {
        let id = booking.id;
        booking.slot_id = None;
        detached.insert(id, booking);
        booking_index.remove(&id);
    }
}

/// The slot an event belongs to, or `None` for registry-level and detached events.
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotCreated { id, .. }
        | Event::SlotCapacityUpdated { id, .. }
        | Event::SlotAvailabilitySet { id, .. }
        | Event::SlotDeleted { id } => Some(*id),
        Event::BookingReserved { booking, .. } => booking.slot_id,
        Event::BookingStatusChanged { slot_id, .. } | Event::BookingArchived { slot_id, .. } => *slot_id,
    }
}

/// Where a booking lives, with the lock needed to change it.
pub(super) enum BookingGuard<'a> {
    Slot(OwnedRwLockWriteGuard<SlotState>),
    Detached(MutexGuard<'a, ()>),
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let booking_to_slot = DashMap::new();
        let detached = DashMap::new();
        let mut slots: HashMap<Ulid, SlotState> = HashMap::new();

        for event in &events {
            match event {
                Event::SlotCreated {
                    id,
                    start_time,
                    end_time,
                    capacity,
                    is_available,
                    note,
                } => {
                    let mut slot = SlotState::new(*id, *start_time, *end_time, capacity.clone(), note.clone());
                    slot.is_available = *is_available;
                    slots.insert(*id, slot);
                }
                Event::SlotDeleted { id } => {
                    if let Some(mut slot) = slots.remove(id) {
                        retire_slot(&mut slot, &booking_to_slot, &detached);
                    }
                }
                other => match event_slot_id(other) {
                    Some(slot_id) => {
                        if let Some(slot) = slots.get_mut(&slot_id) {
                            apply_to_slot(slot, other, &booking_to_slot);
                        }
                    }
                    None => apply_detached(&detached, other),
                },
            }
        }

        let windows = DashMap::new();
        let state = DashMap::new();
        for (id, slot) in slots {
            windows.insert(slot.window(), id);
            state.insert(id, Arc::new(RwLock::new(slot)));
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} slots, {} bookings",
                events.len(),
                state.len(),
                booking_to_slot.len() + detached.len()
            );
        }

        Ok(Self {
            slots: state,
            windows,
            booking_to_slot,
            detached,
            detached_lock: Mutex::new(()),
            gate: RwLock::new(()),
            wal,
        })
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Take the per-slot lock. A slot deleted while we queued reads as missing.
    pub(super) async fn lock_slot(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let rs = self.get_slot(&id).ok_or(EngineError::SlotNotFound(id))?;
        let waited = Instant::now();
        let guard = rs.write_owned().await;
        metrics::histogram!(SLOT_LOCK_WAIT_SECONDS).record(waited.elapsed().as_secs_f64());
        if guard.retired {
            return Err(EngineError::SlotNotFound(id));
        }
        Ok(guard)
    }

    /// Journal an event, then apply it to the locked slot.
    pub(super) async fn persist_and_apply(&self, slot: &mut SlotState, event: Event) -> Result<(), EngineError> {
        self.wal.append(event.clone()).await?;
        apply_to_slot(slot, &event, &self.booking_to_slot);
        Ok(())
    }

    /// Journal an event for a detached booking. Caller holds `detached_lock`.
    pub(super) async fn persist_and_apply_detached(&self, event: Event) -> Result<(), EngineError> {
        self.wal.append(event.clone()).await?;
        apply_detached(&self.detached, &event);
        Ok(())
    }

    /// Journal a slot deletion and detach its bookings. Caller holds the lock.
    pub(super) async fn persist_slot_deletion(&self, slot: &mut SlotState) -> Result<(), EngineError> {
        let id = slot.id;
        self.wal.append(Event::SlotDeleted { id }).await?;
        let window = slot.window();
        retire_slot(slot, &self.booking_to_slot, &self.detached);
        self.windows.remove_if(&window, |_, owner| *owner == id);
        self.slots.remove(&id);
        Ok(())
    }

    /// Lock whatever holds `booking_id`: its slot, or the detached ledger.
    pub(super) async fn lock_booking(&self, booking_id: Ulid) -> Result<BookingGuard<'_>, EngineError> {
        loop {
            let owner = self.booking_to_slot.get(&booking_id).map(|e| *e.value());
            let Some(slot_id) = owner else {
                if self.detached.contains_key(&booking_id) {
                    let guard = self.detached_lock.lock().await;
                    // Recheck under the lock; a slot deletion may have raced us.
                    if self.detached.contains_key(&booking_id) {
                        return Ok(BookingGuard::Detached(guard));
                    }
                    continue;
                }
                return Err(EngineError::BookingNotFound(booking_id));
            };
            if let Some(rs) = self.get_slot(&slot_id) {
                let guard = rs.write_owned().await;
                if !guard.retired {
                    return Ok(BookingGuard::Slot(guard));
                }
            }
            // The slot was deleted after the lookup and its bookings were
            // detached; look again.
            tokio::task::yield_now().await;
        }
    }

    /// Rewrite the journal as the minimal event set reproducing current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let _detached = self.detached_lock.lock().await;

        let handles: Vec<SharedSlotState> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in handles {
            let slot = rs.read().await;
            if slot.retired {
                continue;
            }
            events.push(Event::SlotCreated {
                id: slot.id,
                start_time: slot.start_time,
                end_time: slot.end_time,
                capacity: slot.capacity.clone(),
                is_available: slot.is_available,
                note: slot.note.clone(),
            });
            events.extend(slot.bookings.iter().map(|b| Event::BookingReserved {
                booking: b.clone(),
                saturates_slot: false,
            }));
        }
        events.extend(self.detached.iter().map(|e| Event::BookingReserved {
            booking: e.value().clone(),
            saturates_slot: false,
        }));

        let count = events.len();
        self.wal.compact(events).await?;
        tracing::info!("compacted journal to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
