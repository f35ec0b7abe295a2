use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "stationd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "stationd_query_duration_seconds";

// ── Reservation engine ──────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "stationd_reservations_created_total";

/// Counter: create attempts that lost the unit at commit time.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "stationd_reservation_conflicts_total";

/// Counter: optimistic transactions re-run after the ledger moved underneath them.
pub const TXN_RETRIES_TOTAL: &str = "stationd_txn_retries_total";

/// Counter: transactions abandoned at their deadline, before commit.
pub const TXN_DEADLINE_EXCEEDED_TOTAL: &str = "stationd_txn_deadline_exceeded_total";

/// Counter: status changes applied. Labels: to.
pub const LIFECYCLE_TRANSITIONS_TOTAL: &str = "stationd_lifecycle_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "stationd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stationd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stationd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stationd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stationd_wal_flush_batch_size";

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
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAvailableUnits { .. } => "select_available_units",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::InsertStatusChange { .. } => "insert_status_change",
        Command::InsertPaymentUpdate { .. } => "insert_payment_update",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectPoolReservations { .. } => "select_pool_reservations",
        Command::SelectMyReservations => "select_my_reservations",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
