use chrono::{NaiveDate, NaiveTime, Utc};
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::RESERVATIONS_TOTAL;

use super::occupancy::{effective_capacity, is_full, occupancy};
use super::{Engine, EngineError};

/// Build a [`Vehicle`] from the `vehicle_type` and `custom_vehicle_type` fields.
pub fn parse_vehicle(kind: &str, custom: Option<&str>) -> Result<Vehicle, EngineError> {
    match kind.trim().to_lowercase().as_str() {
        "bike" => Ok(Vehicle::Bike),
        "car" => Ok(Vehicle::Car),
        "suv" => Ok(Vehicle::Suv),
        "other" => {
            let name = custom.map(str::trim).unwrap_or_default();
            if name.is_empty() {
                return Err(EngineError::InvalidVehicle("custom vehicle type is required for 'other'"));
            }
            if name.chars().count() > MAX_CUSTOM_VEHICLE_LEN {
                return Err(EngineError::InvalidVehicle("custom vehicle type too long"));
            }
            Ok(Vehicle::Other(name.to_string()))
        }
        _ => Err(EngineError::InvalidVehicle("vehicle type must be bike, car, suv or other")),
    }
}

fn outcome_label(result: &Result<Booking, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(e) => e.reason(),
    }
}

impl Engine {
    /// Admit a booking for `(slot_id, date)` if the slot has room.
    ///
    /// The capacity check and the insert happen under the slot's write lock
    /// as one journal record, so occupancy can never pass capacity no matter
    /// how many callers race for the last place.
    pub async fn reserve(
        &self,
        booking_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        payload: ReservationPayload,
    ) -> Result<Booking, EngineError> {
        let _gate = self.gate.read().await;
        let result = self.reserve_inner(booking_id, slot_id, date, payload).await;
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        result
    }

    async fn reserve_inner(
        &self,
        booking_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        payload: ReservationPayload,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.lock_slot(slot_id).await?;

        let booked = occupancy(&guard, date);
        let capacity = effective_capacity(&guard);
        if booked >= capacity {
            tracing::debug!("slot {slot_id} full on {date} ({booked}/{capacity}), rejecting {booking_id}");
            return Err(EngineError::SlotFull { slot_id, date, capacity });
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        // Claim the id before journaling so a racing reserve on another slot
        // cannot admit the same booking twice. The detached check comes after
        // the claim: slot deletion detaches a booking before unindexing it.
        match self.booking_to_slot.entry(booking_id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(booking_id)),
            Entry::Vacant(v) => {
                v.insert(slot_id);
            }
        }
        if self.detached.contains_key(&booking_id) {
            self.booking_to_slot.remove_if(&booking_id, |_, owner| *owner == slot_id);
            return Err(EngineError::AlreadyExists(booking_id));
        }

        let booking = Booking {
            id: booking_id,
            customer_id: payload.customer_id,
            package_id: payload.package_id,
            slot_id: Some(slot_id),
            date,
            status: BookingStatus::Pending,
            vehicle: payload.vehicle,
            address: payload.address,
            contact_number: payload.contact_number,
            created_at: Utc::now(),
            customer_archive: None,
            supervisor_archive: None,
        };
        let saturates_slot = booked + 1 >= capacity && guard.is_available;
        let event = Event::BookingReserved {
            booking: booking.clone(),
            saturates_slot,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, event).await {
            self.booking_to_slot.remove_if(&booking_id, |_, owner| *owner == slot_id);
            return Err(e);
        }

        tracing::info!("booking {booking_id} admitted to slot {slot_id} on {date} ({}/{capacity})", booked + 1);
        if saturates_slot {
            tracing::info!("slot {slot_id} saturated on {date}, marked unavailable");
            metrics::counter!(crate::observability::AVAILABILITY_FLIPS_TOTAL, "to" => "unavailable").increment(1);
        }
        Ok(booking)
    }

    /// Customer-facing booking entry point.
    ///
    /// Runs the form checks on a read lock: date not before `today`, text field
    /// limits, slot exists and is open, slot window not over when booking for
    /// today (`now` is the local time of day), slot not already full. Then hands
    /// off to [`Engine::reserve`], which checks capacity again under the write lock.
    pub async fn submit_booking(
        &self,
        booking_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        payload: ReservationPayload,
        today: NaiveDate,
        now: NaiveTime,
    ) -> Result<Booking, EngineError> {
        if date < today {
            return Err(EngineError::DateInPast(date));
        }
        if payload.address.as_ref().is_some_and(|a| a.len() > MAX_ADDRESS_LEN) {
            return Err(EngineError::LimitExceeded("address too long"));
        }
        if payload.contact_number.as_ref().is_some_and(|c| c.len() > MAX_CONTACT_LEN) {
            return Err(EngineError::LimitExceeded("contact number too long"));
        }

        let rs = self.get_slot(&slot_id).ok_or(EngineError::SlotNotFound(slot_id))?;
        {
            let slot = rs.read().await;
            if slot.retired {
                return Err(EngineError::SlotNotFound(slot_id));
            }
            if !slot.is_available {
                return Err(EngineError::SlotUnavailable(slot_id));
            }
            if date == today && slot.end_time <= now {
                return Err(EngineError::SlotExpired {
                    slot_id,
                    end: slot.end_time,
                });
            }
            if is_full(&slot, date) {
                return Err(EngineError::SlotFull {
                    slot_id,
                    date,
                    capacity: effective_capacity(&slot),
                });
            }
        }

        self.reserve(booking_id, slot_id, date, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_kinds() {
        assert_eq!(parse_vehicle("car", None).unwrap(), Vehicle::Car);
        assert_eq!(parse_vehicle(" SUV ", None).unwrap(), Vehicle::Suv);
        // custom name is only read for "other"
        assert_eq!(parse_vehicle("bike", Some("ignored")).unwrap(), Vehicle::Bike);
        assert_eq!(
            parse_vehicle("other", Some(" tractor ")).unwrap(),
            Vehicle::Other("tractor".into())
        );
    }

    #[test]
    fn other_needs_a_name() {
        for custom in [None, Some(""), Some("   ")] {
            let err = parse_vehicle("other", custom).unwrap_err();
            assert_eq!(err.reason(), "invalid_vehicle");
        }
        let long = "x".repeat(MAX_CUSTOM_VEHICLE_LEN + 1);
        assert!(parse_vehicle("other", Some(&long)).is_err());
    }

    #[test]
    fn unknown_vehicle_rejected() {
        assert!(matches!(parse_vehicle("truck", None), Err(EngineError::InvalidVehicle(_))));
    }
}
