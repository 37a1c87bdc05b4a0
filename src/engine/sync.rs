use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::observability::AVAILABILITY_FLIPS_TOTAL;

use super::occupancy::desired_flag;
use super::{Engine, EngineError};

impl Engine {
    /// Bring the slot's advisory flag in line with its occupancy on `date`.
    ///
    /// Returns the flag value afterwards. Writes nothing when the flag
    /// already matches, so repeated calls are free.
    pub async fn resync(&self, slot_id: Ulid, date: NaiveDate) -> Result<bool, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_slot(slot_id).await?;
        self.resync_locked(&mut guard, date).await
    }

    /// Resync under a lock the caller already holds.
    pub(super) async fn resync_locked(&self, slot: &mut SlotState, date: NaiveDate) -> Result<bool, EngineError> {
        let desired = desired_flag(slot, date);
        if slot.is_available == desired {
            return Ok(desired);
        }
        let event = Event::SlotAvailabilitySet {
            id: slot.id,
            is_available: desired,
        };
        self.persist_and_apply(slot, event).await?;

        let to = if desired { "available" } else { "unavailable" };
        metrics::counter!(AVAILABILITY_FLIPS_TOTAL, "to" => to).increment(1);
        tracing::info!("slot {} marked {to} after resync for {date}", slot.id);
        Ok(desired)
    }

    /// Resync after a write that already committed. A failure here leaves
    /// only the advisory flag stale, so it is logged rather than returned.
    pub(super) async fn resync_after_write(&self, slot: &mut SlotState, date: NaiveDate) {
        if let Err(e) = self.resync_locked(slot, date).await {
            tracing::warn!("resync of slot {} for {date} failed: {e}", slot.id);
        }
    }
}
