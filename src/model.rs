use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_CAPACITY;

/// Capacity assumed whenever a slot's stored capacity is missing or invalid.
pub const DEFAULT_CAPACITY: u32 = 2;

/// A slot's capacity as it sits in the journal.
///
/// New writes are always validated into `Value`; the other variants exist so
/// records carried over from older stores still load and read as the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredCapacity {
    Value(i64),
    Missing,
    Unparsed(String),
}

impl StoredCapacity {
    /// The capacity every admission and listing decision uses.
    pub fn effective(&self) -> u32 {
        match self {
            StoredCapacity::Value(n) if *n >= 1 && *n <= MAX_CAPACITY as i64 => *n as u32,
            _ => DEFAULT_CAPACITY,
        }
    }
}

impl From<u32> for StoredCapacity {
    fn from(value: u32) -> Self {
        StoredCapacity::Value(value as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Cancelled bookings never hold a place in a slot.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn is_archivable(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "in_progress" => Ok(BookingStatus::InProgress),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vehicle {
    Bike,
    Car,
    Suv,
    /// Free-text description supplied by the customer.
    Other(String),
}

impl Vehicle {
    pub fn kind(&self) -> &'static str {
        match self {
            Vehicle::Bike => "bike",
            Vehicle::Car => "car",
            Vehicle::Suv => "suv",
            Vehicle::Other(_) => "other",
        }
    }

    pub fn custom(&self) -> Option<&str> {
        match self {
            Vehicle::Other(name) => Some(name),
            _ => None,
        }
    }
}

/// Which party hid a booking from their own view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveSide {
    Customer,
    Supervisor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMark {
    pub at: DateTime<Utc>,
    pub by: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub package_id: Ulid,
    /// `None` for legacy records and for bookings whose slot was deleted.
    pub slot_id: Option<Ulid>,
    pub date: NaiveDate,
    pub status: BookingStatus,
    pub vehicle: Vehicle,
    pub address: Option<String>,
    pub contact_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub customer_archive: Option<ArchiveMark>,
    pub supervisor_archive: Option<ArchiveMark>,
}

impl Booking {
    pub fn archive_mark(&self, side: ArchiveSide) -> Option<&ArchiveMark> {
        match side {
            ArchiveSide::Customer => self.customer_archive.as_ref(),
            ArchiveSide::Supervisor => self.supervisor_archive.as_ref(),
        }
    }

    pub fn is_archived_by(&self, side: ArchiveSide) -> bool {
        self.archive_mark(side).is_some()
    }

    pub fn set_archive_mark(&mut self, side: ArchiveSide, mark: ArchiveMark) {
        match side {
            ArchiveSide::Customer => self.customer_archive = Some(mark),
            ArchiveSide::Supervisor => self.supervisor_archive = Some(mark),
        }
    }
}

/// Everything the customer supplies when asking for a place in a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationPayload {
    pub customer_id: Ulid,
    pub package_id: Ulid,
    pub vehicle: Vehicle,
    pub address: Option<String>,
    pub contact_number: Option<String>,
}

/// A recurring daily window and the bookings that reference it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: StoredCapacity,
    /// Advisory only. Per-date availability is always recounted from bookings.
    pub is_available: bool,
    pub note: Option<String>,
    /// Bookings referencing this slot, sorted by `date`.
    pub bookings: Vec<Booking>,
    /// Set under the write lock when the slot is deleted, so a waiter that
    /// cloned the handle earlier sees the slot as gone.
    pub retired: bool,
}

impl SlotState {
    pub fn new(
        id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: StoredCapacity,
        note: Option<String>,
    ) -> Self {
        Self {
            id,
            start_time,
            end_time,
            capacity,
            is_available: true,
            note,
            bookings: Vec::new(),
            retired: false,
        }
    }

    pub fn window(&self) -> (NaiveTime, NaiveTime) {
        (self.start_time, self.end_time)
    }

    /// Insert keeping date order; same-date bookings stay in arrival order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self.bookings.partition_point(|b| b.date <= booking.date);
        self.bookings.insert(pos, booking);
    }

    /// Bookings on `date`, located by binary search.
    pub fn on_date(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        &self.bookings[lo..hi]
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }
}

/// Journal record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: StoredCapacity,
        is_available: bool,
        note: Option<String>,
    },
    SlotCapacityUpdated {
        id: Ulid,
        capacity: u32,
    },
    SlotAvailabilitySet {
        id: Ulid,
        is_available: bool,
    },
    SlotDeleted {
        id: Ulid,
    },
    /// A booking admitted by the coordinator. `saturates_slot` carries the
    /// flag flip in the same record so the two can never be split.
    BookingReserved {
        booking: Booking,
        saturates_slot: bool,
    },
    BookingStatusChanged {
        id: Ulid,
        slot_id: Option<Ulid>,
        status: BookingStatus,
    },
    BookingArchived {
        id: Ulid,
        slot_id: Option<Ulid>,
        side: ArchiveSide,
        mark: ArchiveMark,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One row of the per-date slot listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotListing {
    pub id: Ulid,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub booked_count: u32,
    pub available_for_date: bool,
    pub is_available: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
}
