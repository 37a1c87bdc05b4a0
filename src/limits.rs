/// Hard caps on what a single engine will hold or accept.

pub const MAX_SLOTS: usize = 1_000;
pub const MAX_BOOKINGS_PER_SLOT: usize = 100_000;

/// Largest capacity a slot may be configured with (fits a SQL SMALLINT).
pub const MAX_CAPACITY: u32 = 32_767;

pub const MAX_NOTE_LEN: usize = 255;
pub const MAX_ADDRESS_LEN: usize = 1_024;
pub const MAX_CONTACT_LEN: usize = 15;
pub const MAX_CUSTOM_VEHICLE_LEN: usize = 50;

/// Upper bound on slots produced by one schedule generation run.
pub const MAX_GENERATED_SLOTS: usize = 288;
