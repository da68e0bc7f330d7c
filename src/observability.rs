use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotlock_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotlock_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: holds committed to the ledger.
pub const HOLDS_CREATED_TOTAL: &str = "slotlock_holds_created_total";

/// Counter: hold attempts that lost the slot. Labels: stage (precheck, insert).
pub const SLOT_TAKEN_TOTAL: &str = "slotlock_slot_taken_total";

/// Counter: holds released because their deadline passed.
pub const EXPIRATIONS_TOTAL: &str = "slotlock_expirations_total";

/// Counter: holds confirmed by a payment.
pub const CONFIRMATIONS_TOTAL: &str = "slotlock_confirmations_total";

/// Counter: payments that succeeded for an already released hold.
pub const PAID_BUT_EXPIRED_TOTAL: &str = "slotlock_paid_but_expired_total";

/// Counter: calendar mirror events deleted after release.
pub const MIRRORS_REMOVED_TOTAL: &str = "slotlock_mirrors_removed_total";

/// Counter: retried calendar calls. Labels: op.
pub const CALENDAR_RETRIES_TOTAL: &str = "slotlock_calendar_retries_total";

/// Counter: calendar calls that failed after every retry. Labels: op.
pub const CALENDAR_FAILURES_TOTAL: &str = "slotlock_calendar_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotlock_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotlock_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotlock_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotlock_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotlock_wal_flush_batch_size";

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
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertHold { .. } => "insert_hold",
        Command::InsertPaymentEvent { .. } => "insert_payment_event",
        Command::InsertTransition { .. } => "insert_transition",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectEscalations => "select_escalations",
    }
}
