use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("slot {slot_id} is fully booked on {date} ({capacity} vehicles); choose another slot or date")]
    SlotFull {
        slot_id: Ulid,
        date: NaiveDate,
        capacity: u32,
    },
    #[error("slot {0} no longer exists")]
    SlotNotFound(Ulid),
    #[error("slot {0} is not open for booking")]
    SlotUnavailable(Ulid),
    #[error("booking {0} not found")]
    BookingNotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("a slot {start}-{end} already exists")]
    DuplicateWindow { start: NaiveTime, end: NaiveTime },
    #[error("slot must end after it starts ({start}-{end})")]
    InvalidWindow { start: NaiveTime, end: NaiveTime },
    #[error("capacity must be a positive integer, got {0:?}")]
    InvalidCapacity(String),
    #[error("invalid status: {0:?}")]
    InvalidStatus(String),
    #[error("invalid vehicle: {0}")]
    InvalidVehicle(&'static str),
    #[error("date {0} is in the past; choose a future date")]
    DateInPast(NaiveDate),
    #[error("slot {slot_id} already ended at {end} today; choose a later slot or date")]
    SlotExpired { slot_id: Ulid, end: NaiveTime },
    #[error("only pending bookings can be cancelled (booking is {0})")]
    NotCancellable(BookingStatus),
    #[error("only completed or cancelled bookings can be archived (booking is {0})")]
    NotArchivable(BookingStatus),
    #[error("cannot delete slot {slot_id}: it has bookings on {date}")]
    HasBookingsForDate { slot_id: Ulid, date: NaiveDate },
    #[error("permission denied: {0}")]
    Forbidden(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("journal error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable reason, surfaced to clients ahead of the message.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::SlotFull { .. } => "slot_full",
            EngineError::SlotNotFound(_) => "slot_not_found",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::DuplicateWindow { .. } => "duplicate_window",
            EngineError::InvalidWindow { .. } => "invalid_window",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::InvalidStatus(_) => "invalid_status",
            EngineError::InvalidVehicle(_) => "invalid_vehicle",
            EngineError::DateInPast(_) => "date_in_past",
            EngineError::SlotExpired { .. } => "slot_expired",
            EngineError::NotCancellable(_) => "not_cancellable",
            EngineError::NotArchivable(_) => "not_archivable",
            EngineError::HasBookingsForDate { .. } => "has_bookings_for_date",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal_error",
        }
    }

    /// Whether the caller can fix this by changing the request.
    pub fn is_user_recoverable(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::WalError(e.to_string())
    }
}
