use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::occupancy::listing;
use super::{Engine, EngineError};

/// Working-day layout used by bulk slot generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub interval_minutes: u32,
    /// Intervals starting inside `[start, end)` are skipped.
    pub break_window: Option<(NaiveTime, NaiveTime)>,
    pub capacity: u32,
}

impl Default for Schedule {
    fn default() -> Self {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
        Self {
            open: hm(9, 0),
            close: hm(18, 0),
            interval_minutes: 30,
            break_window: Some((hm(13, 0), hm(14, 0))),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Schedule {
    /// Every `(start, end)` window the schedule produces, in order.
    pub fn windows(&self) -> Vec<(NaiveTime, NaiveTime)> {
        let step = TimeDelta::minutes(self.interval_minutes as i64);
        let mut out = Vec::new();
        if step <= TimeDelta::zero() {
            return out;
        }
        let mut start = self.open;
        while start < self.close && out.len() < MAX_GENERATED_SLOTS {
            let (end, wrapped) = start.overflowing_add_signed(step);
            if wrapped != 0 || end > self.close {
                break;
            }
            let in_break = self
                .break_window
                .is_some_and(|(from, until)| start >= from && start < until);
            if !in_break {
                out.push((start, end));
            }
            start = end;
        }
        out
    }
}

/// Validate a capacity typed by a supervisor. Stored values are never run
/// through this; they fall back to the default when read.
pub fn parse_capacity_input(raw: &str) -> Result<u32, EngineError> {
    match raw.trim().parse::<i64>() {
        Ok(n) if n >= 1 && n <= MAX_CAPACITY as i64 => Ok(n as u32),
        _ => Err(EngineError::InvalidCapacity(raw.to_string())),
    }
}

impl Engine {
    pub async fn create_slot(
        &self,
        id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: u32,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        self.create_slot_inner(id, start_time, end_time, capacity, note).await
    }

    async fn create_slot_inner(
        &self,
        id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: u32,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        if start_time >= end_time {
            return Err(EngineError::InvalidWindow {
                start: start_time,
                end: end_time,
            });
        }
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(EngineError::InvalidCapacity(capacity.to_string()));
        }
        let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        if note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("slot note too long"));
        }
        if self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        // The new slot is locked before it becomes visible, so nobody can
        // reserve against it until its creation is journaled.
        let state = SlotState::new(id, start_time, end_time, StoredCapacity::from(capacity), note.clone());
        let rs = Arc::new(RwLock::new(state));
        let mut guard = rs.clone().write_owned().await;

        let window = (start_time, end_time);
        match self.windows.entry(window) {
            Entry::Occupied(_) => {
                return Err(EngineError::DuplicateWindow {
                    start: start_time,
                    end: end_time,
                });
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }
        match self.slots.entry(id) {
            Entry::Occupied(_) => {
                self.windows.remove(&window);
                return Err(EngineError::AlreadyExists(id));
            }
            Entry::Vacant(v) => {
                v.insert(rs);
            }
        }

        let event = Event::SlotCreated {
            id,
            start_time,
            end_time,
            capacity: StoredCapacity::from(capacity),
            is_available: true,
            note,
        };
        if let Err(e) = self.wal.append(event).await {
            guard.retired = true;
            self.slots.remove(&id);
            self.windows.remove(&window);
            return Err(e.into());
        }
        tracing::info!("slot {id} created ({start_time}-{end_time}, capacity {capacity})");
        Ok(())
    }

    /// Create every schedule window that does not exist yet. Returns how many
    /// slots were created.
    pub async fn generate_default_slots(&self, schedule: &Schedule) -> Result<usize, EngineError> {
        let _gate = self.gate.read().await;
        let mut created = 0;
        for (start, end) in schedule.windows() {
            if self.windows.contains_key(&(start, end)) {
                continue;
            }
            match self
                .create_slot_inner(Ulid::new(), start, end, schedule.capacity, None)
                .await
            {
                Ok(()) => created += 1,
                // lost a race with a manual create of the same window
                Err(EngineError::DuplicateWindow { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!("generated {created} slots");
        Ok(created)
    }

    /// Flip the global availability flag. Returns the new value.
    pub async fn toggle_slot(&self, slot_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_slot(slot_id).await?;
        let is_available = !guard.is_available;
        self.persist_and_apply(&mut guard, Event::SlotAvailabilitySet { id: slot_id, is_available })
            .await?;
        tracing::info!("slot {slot_id} toggled to {}", if is_available { "available" } else { "unavailable" });
        Ok(is_available)
    }

    /// Set a new capacity from raw supervisor input, then resync the flag
    /// against `view_date`. Returns the slot as seen on that date.
    pub async fn update_capacity(
        &self,
        slot_id: Ulid,
        raw: &str,
        view_date: NaiveDate,
    ) -> Result<SlotListing, EngineError> {
        let capacity = parse_capacity_input(raw)?;
        let _gate = self.gate.read().await;
        let mut guard = self.lock_slot(slot_id).await?;
        self.persist_and_apply(&mut guard, Event::SlotCapacityUpdated { id: slot_id, capacity })
            .await?;
        tracing::info!("slot {slot_id} capacity set to {capacity}");
        self.resync_after_write(&mut guard, view_date).await;
        Ok(listing(&guard, view_date))
    }

    /// Delete a slot unless any booking references it on `view_date`.
    ///
    /// Only the reviewed date is checked. Bookings on other dates survive
    /// with no slot.
    pub async fn delete_slot(&self, slot_id: Ulid, view_date: NaiveDate) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_slot(slot_id).await?;
        if !guard.on_date(view_date).is_empty() {
            return Err(EngineError::HasBookingsForDate {
                slot_id,
                date: view_date,
            });
        }
        let orphaned = guard.bookings.len();
        self.persist_slot_deletion(&mut guard).await?;
        tracing::info!("slot {slot_id} deleted ({orphaned} bookings on other dates detached)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn default_schedule_skips_lunch() {
        let windows = Schedule::default().windows();
        // 09:00-13:00 and 14:00-18:00 in half hours
        assert_eq!(windows.len(), 16);
        assert_eq!(windows[0], (t(9, 0), t(9, 30)));
        assert_eq!(windows[7], (t(12, 30), t(13, 0)));
        assert_eq!(windows[8], (t(14, 0), t(14, 30)));
        assert_eq!(windows[15], (t(17, 30), t(18, 0)));
        assert!(windows.iter().all(|(s, _)| *s < t(13, 0) || *s >= t(14, 0)));
    }

    #[test]
    fn schedule_without_break() {
        let schedule = Schedule {
            open: t(8, 0),
            close: t(10, 0),
            interval_minutes: 60,
            break_window: None,
            capacity: 3,
        };
        assert_eq!(schedule.windows(), vec![(t(8, 0), t(9, 0)), (t(9, 0), t(10, 0))]);
    }

    #[test]
    fn schedule_stops_at_close() {
        let schedule = Schedule {
            open: t(9, 0),
            close: t(10, 0),
            interval_minutes: 45,
            break_window: None,
            capacity: 2,
        };
        assert_eq!(schedule.windows(), vec![(t(9, 0), t(9, 45))]);
    }

    #[test]
    fn schedule_near_midnight_does_not_wrap() {
        let schedule = Schedule {
            open: t(23, 0),
            close: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            interval_minutes: 30,
            break_window: None,
            capacity: 2,
        };
        assert_eq!(schedule.windows(), vec![(t(23, 0), t(23, 30))]);
    }

    #[test]
    fn capacity_input_validation() {
        assert_eq!(parse_capacity_input("3").unwrap(), 3);
        assert_eq!(parse_capacity_input(" 10 ").unwrap(), 10);
        for bad in ["0", "-1", "abc", "", "2.5", "40000"] {
            let err = parse_capacity_input(bad).unwrap_err();
            assert_eq!(err.reason(), "invalid_capacity", "{bad:?}");
        }
    }
}
