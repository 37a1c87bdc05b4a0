use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bayslot_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bayslot_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (`admitted` or a rejection reason).
pub const RESERVATIONS_TOTAL: &str = "bayslot_reservations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bayslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bayslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bayslot_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "bayslot_auth_failures_total";

/// Histogram: time spent waiting for a slot's write lock, in seconds.
pub const SLOT_LOCK_WAIT_SECONDS: &str = "bayslot_slot_lock_wait_seconds";

/// Counter: advisory availability flag changes made by the engine. Labels: to.
pub const AVAILABILITY_FLIPS_TOTAL: &str = "bayslot_availability_flips_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bayslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bayslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlot { .. } => "insert_slot",
        Command::GenerateSlots => "generate_slots",
        Command::ToggleSlot { .. } => "toggle_slot",
        Command::UpdateCapacity { .. } => "update_capacity",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::ArchiveBooking { .. } => "archive_booking",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectOpenSlots { .. } => "select_open_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBookingStats => "select_booking_stats",
    }
}
