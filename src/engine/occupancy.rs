use chrono::NaiveDate;

use crate::model::*;

// ── Occupancy ─────────────────────────────────────────────────────

/// Number of bookings on `date` that hold a place in the slot.
pub fn occupancy(slot: &SlotState, date: NaiveDate) -> u32 {
    slot.on_date(date)
        .iter()
        .filter(|b| b.status.occupies_slot())
        .count() as u32
}

pub fn effective_capacity(slot: &SlotState) -> u32 {
    slot.capacity.effective()
}

pub fn is_full(slot: &SlotState, date: NaiveDate) -> bool {
    occupancy(slot, date) >= effective_capacity(slot)
}

/// What the advisory flag should read given the bookings on `date`.
pub fn desired_flag(slot: &SlotState, date: NaiveDate) -> bool {
    !is_full(slot, date)
}

pub fn listing(slot: &SlotState, date: NaiveDate) -> SlotListing {
    let booked_count = occupancy(slot, date);
    let capacity = effective_capacity(slot);
    SlotListing {
        id: slot.id,
        start_time: slot.start_time,
        end_time: slot.end_time,
        capacity,
        booked_count,
        available_for_date: booked_count < capacity,
        is_available: slot.is_available,
        note: slot.note.clone(),
    }
}

/// Slots a customer may pick for `date`: globally open and not yet full.
///
/// Display-only. The reading is stale as soon as the locks are dropped and the
/// coordinator re-checks capacity before admitting anything.
pub fn open_for_date<'a>(
    slots: impl IntoIterator<Item = &'a SlotState>,
    date: NaiveDate,
) -> Vec<SlotListing> {
    slots
        .into_iter()
        .filter(|s| s.is_available && !s.retired)
        .map(|s| listing(s, date))
        .filter(|l| l.available_for_date)
        .collect()
}
