use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "classbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "classbook_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (`booked` or error kind).
pub const RESERVATIONS_TOTAL: &str = "classbook_reservations_total";

/// Counter: bookings cancelled. Labels: source (booking, session_deleted, series_deactivated).
pub const CANCELLATIONS_TOTAL: &str = "classbook_cancellations_total";

/// Counter: sessions created from a recurring series. Labels: source (create, extend, roll).
pub const SESSIONS_MATERIALIZED_TOTAL: &str = "classbook_sessions_materialized_total";

/// Counter: occurrences skipped during materialization. Labels: reason.
pub const OCCURRENCES_SKIPPED_TOTAL: &str = "classbook_occurrences_skipped_total";

// ── Background jobs ─────────────────────────────────────────────

/// Counter: lifecycle sweeps run. Labels: status (ok, error, timeout).
pub const SWEEP_RUNS_TOTAL: &str = "classbook_sweep_runs_total";

/// Counter: bookings moved to completed by the sweeper.
pub const SWEEP_COMPLETED_BOOKINGS_TOTAL: &str = "classbook_sweep_completed_bookings_total";

/// Gauge: consecutive failed sweeps for a tenant.
pub const SWEEP_CONSECUTIVE_FAILURES: &str = "classbook_sweep_consecutive_failures";

/// Histogram: sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "classbook_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "classbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "classbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "classbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "classbook_tenants_active";

/// Counter: logins the member directory could not resolve.
pub const AUTH_FAILURES_TOTAL: &str = "classbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "classbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "classbook_wal_flush_batch_size";

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSession { .. } => "insert_session",
        Command::UpdateSession { .. } => "update_session",
        Command::DeleteSession { .. } => "delete_session",
        Command::InsertSeries { .. } => "insert_series",
        Command::ExtendSeries { .. } => "extend_series",
        Command::DeleteSeries { .. } => "delete_series",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertUnavailability { .. } => "insert_unavailability",
        Command::DeleteUnavailability { .. } => "delete_unavailability",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSeries { .. } => "select_series",
        Command::SelectUnavailability { .. } => "select_unavailability",
    }
}
