use chrono::Utc;
use ulid::Ulid;

use crate::model::*;

use super::occupancy::{effective_capacity, is_full};
use super::{BookingGuard, Engine, EngineError};

impl Engine {
    /// Supervisor status change: any status to any status.
    ///
    /// Moving a cancelled booking back to a counted status takes a place in
    /// the slot again, so it is refused when the slot is full on that date.
    pub async fn set_booking_status(&self, booking_id: Ulid, raw_status: &str) -> Result<Booking, EngineError> {
        let status: BookingStatus = raw_status
            .parse()
            .map_err(|_| EngineError::InvalidStatus(raw_status.to_string()))?;
        let booking = self
            .update_booking(booking_id, |current| {
                if current.status == status {
                    return Ok(None);
                }
                Ok(Some(Event::BookingStatusChanged {
                    id: booking_id,
                    slot_id: current.slot_id,
                    status,
                }))
            })
            .await?;
        tracing::info!("booking {booking_id} status set to {status}");
        Ok(booking)
    }

    /// Customer cancellation. Only the owner may cancel, and only while pending.
    pub async fn cancel_booking(&self, booking_id: Ulid, customer_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self
            .update_booking(booking_id, |current| {
                if current.customer_id != customer_id {
                    return Err(EngineError::BookingNotFound(booking_id));
                }
                if current.status != BookingStatus::Pending {
                    return Err(EngineError::NotCancellable(current.status));
                }
                Ok(Some(Event::BookingStatusChanged {
                    id: booking_id,
                    slot_id: current.slot_id,
                    status: BookingStatus::Cancelled,
                }))
            })
            .await?;
        tracing::info!("booking {booking_id} cancelled by customer {customer_id}");
        Ok(booking)
    }

    /// Hide a finished booking from one side's view. Archiving twice is a no-op.
    ///
    /// Customers may only archive their own bookings; `actor` is recorded as
    /// the archiving user either way.
    pub async fn archive_booking(&self, booking_id: Ulid, side: ArchiveSide, actor: Ulid) -> Result<Booking, EngineError> {
        self.update_booking(booking_id, |current| {
            if side == ArchiveSide::Customer && current.customer_id != actor {
                return Err(EngineError::BookingNotFound(booking_id));
            }
            if !current.status.is_archivable() {
                return Err(EngineError::NotArchivable(current.status));
            }
            if current.is_archived_by(side) {
                return Ok(None);
            }
            Ok(Some(Event::BookingArchived {
                id: booking_id,
                slot_id: current.slot_id,
                side,
                mark: ArchiveMark { at: Utc::now(), by: actor },
            }))
        })
        .await
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Option<Booking> {
        let slot_id = self.booking_to_slot.get(&booking_id).map(|e| *e.value());
        if let Some(slot_id) = slot_id
            && let Some(rs) = self.get_slot(&slot_id)
            && let Some(b) = rs.read().await.booking(&booking_id)
        {
            return Some(b.clone());
        }
        self.detached.get(&booking_id).map(|e| e.value().clone())
    }

    /// Lock the booking, let `decide` pick the event to write (or `None` for
    /// no change), journal it, and resync the slot after status changes.
    async fn update_booking<F>(&self, booking_id: Ulid, decide: F) -> Result<Booking, EngineError>
    where
        F: FnOnce(&Booking) -> Result<Option<Event>, EngineError>,
    {
        let _gate = self.gate.read().await;
        match self.lock_booking(booking_id).await? {
            BookingGuard::Slot(mut guard) => {
                let current = guard
                    .booking(&booking_id)
                    .cloned()
                    .ok_or(EngineError::BookingNotFound(booking_id))?;
                let Some(event) = decide(&current)? else {
                    return Ok(current);
                };
                if let Event::BookingStatusChanged { status, .. } = &event
                    && !current.status.occupies_slot()
                    && status.occupies_slot()
                    && is_full(&guard, current.date)
                {
                    return Err(EngineError::SlotFull {
                        slot_id: guard.id,
                        date: current.date,
                        capacity: effective_capacity(&guard),
                    });
                }
                let status_changed = matches!(event, Event::BookingStatusChanged { .. });
                self.persist_and_apply(&mut guard, event).await?;
                if status_changed {
                    self.resync_after_write(&mut guard, current.date).await;
                }
                guard
                    .booking(&booking_id)
                    .cloned()
                    .ok_or(EngineError::BookingNotFound(booking_id))
            }
            BookingGuard::Detached(_held) => {
                let current = self
                    .detached
                    .get(&booking_id)
                    .map(|e| e.value().clone())
                    .ok_or(EngineError::BookingNotFound(booking_id))?;
                let Some(event) = decide(&current)? else {
                    return Ok(current);
                };
                self.persist_and_apply_detached(event).await?;
                self.detached
                    .get(&booking_id)
                    .map(|e| e.value().clone())
                    .ok_or(EngineError::BookingNotFound(booking_id))
            }
        }
    }
}
