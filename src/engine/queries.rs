use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::occupancy::{listing, open_for_date};
use super::Engine;

impl Engine {
    /// Run `read` against every live slot, ordered by start time.
    ///
    /// Holds at most one slot lock at a time.
    async fn each_slot<T>(&self, read: impl Fn(&SlotState) -> T) -> Vec<T> {
        let handles: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut seen: Vec<((NaiveTime, NaiveTime), T)> = Vec::with_capacity(handles.len());
        for rs in handles {
            let slot = rs.read().await;
            if !slot.retired {
                seen.push((slot.window(), read(&slot)));
            }
        }
        seen.sort_by_key(|(window, _)| *window);
        seen.into_iter().map(|(_, value)| value).collect()
    }

    /// Every slot with its effective capacity and booked count on `date`.
    pub async fn slots_for_date(&self, date: NaiveDate) -> Vec<SlotListing> {
        self.each_slot(|slot| listing(slot, date)).await
    }

    /// Globally open slots with room left on `date`. Advisory: a slot listed
    /// here can still be full by the time a reservation reaches it.
    pub async fn open_slots_for_date(&self, date: NaiveDate) -> Vec<SlotListing> {
        self.each_slot(|slot| open_for_date([slot], date))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Bookings matching `keep`, newest date first, then newest creation first.
    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let per_slot = self
            .each_slot(|slot| slot.bookings.iter().filter(|b| keep(b)).cloned().collect::<Vec<_>>())
            .await;
        let mut out: Vec<Booking> = per_slot.into_iter().flatten().collect();
        out.extend(self.detached.iter().map(|e| e.value().clone()).filter(|b| keep(b)));
        out.sort_by(|a, b| b.date.cmp(&a.date).then(b.created_at.cmp(&a.created_at)));
        out
    }

    /// A customer's own bookings, either the active list or the archived one.
    pub async fn customer_bookings(&self, customer_id: Ulid, archived: bool) -> Vec<Booking> {
        self.collect_bookings(|b| b.customer_id == customer_id && b.is_archived_by(ArchiveSide::Customer) == archived)
            .await
    }

    pub async fn supervisor_bookings(&self, archived: bool) -> Vec<Booking> {
        self.collect_bookings(|b| b.is_archived_by(ArchiveSide::Supervisor) == archived)
            .await
    }

    /// Dashboard counts over bookings the supervisor has not archived.
    pub async fn booking_stats(&self) -> BookingStats {
        let mut stats = BookingStats::default();
        for b in self.supervisor_bookings(false).await {
            stats.total += 1;
            match b.status {
                BookingStatus::Pending => stats.pending += 1,
                BookingStatus::InProgress => stats.in_progress += 1,
                BookingStatus::Completed => stats.completed += 1,
                BookingStatus::Cancelled => {}
            }
        }
        stats
    }
}
