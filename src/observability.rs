use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "staylock_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "staylock_query_duration_seconds";

/// Counter: mutations refused because the dates were taken. Labels: command.
pub const CONFLICTS_TOTAL: &str = "staylock_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "staylock_connections_active";
pub const CONNECTIONS_TOTAL: &str = "staylock_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staylock_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "staylock_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staylock_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "staylock_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "staylock_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(bind: &str, port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let ip = bind.parse().unwrap_or([0, 0, 0, 0].into());
    let addr = SocketAddr::new(ip, port);
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking(_) => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RebookBooking { .. } => "rebook_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookingsByGuest { .. } => "select_bookings_by_guest",
        Command::SelectBookingsByProperty { .. } => "select_bookings_by_property",
        Command::InsertBlock(_) => "insert_block",
        Command::UpdateBlock { .. } => "update_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::SelectBlock { .. } => "select_block",
        Command::SelectBlocks { .. } => "select_blocks",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn labels_are_snake_case() {
        let cmds = [
            Command::CancelBooking { id: Ulid::new() },
            Command::DeleteBlock { id: Ulid::new() },
            Command::SelectBlocks {
                property_id: "p".into(),
            },
        ];
        let labels: Vec<_> = cmds.iter().map(command_label).collect();
        assert_eq!(labels, ["cancel_booking", "delete_block", "select_blocks"]);
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init("0.0.0.0", None).is_ok());
    }
}
