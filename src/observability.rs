use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "gymd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "gymd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "gymd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "gymd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gymd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "gymd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gymd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gymd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertInstructor { .. } => "insert_instructor",
        Command::UpdateInstructor { .. } => "update_instructor",
        Command::DeleteInstructor { .. } => "delete_instructor",
        Command::ToggleInstructorAvailability { .. } => "toggle_instructor_availability",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::ToggleSlotAvailability { .. } => "toggle_slot_availability",
        Command::InsertSession { .. } => "insert_session",
        Command::UpdateSession { .. } => "update_session",
        Command::DeleteSession { .. } => "delete_session",
        Command::ToggleSessionCompleted { .. } => "toggle_session_completed",
        Command::SelectInstructors => "select_instructors",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSessions => "select_sessions",
        Command::SelectStats => "select_stats",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAvailableInstructors { .. } => "select_available_instructors",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
