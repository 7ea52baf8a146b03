use std::net::SocketAddr;

use crate::wire::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: coordinator operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "occupancy_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "occupancy_operation_duration_seconds";

/// Counter: wire requests handled. Labels: command.
pub const REQUESTS_TOTAL: &str = "occupancy_requests_total";

// ── Contention ──────────────────────────────────────────────────

/// Counter: take attempts refused because another actor held the lock.
pub const LOCK_DENIALS_TOTAL: &str = "occupancy_lock_denials_total";

/// Counter: conditional writes that lost a version race.
pub const VERSION_CONFLICTS_TOTAL: &str = "occupancy_version_conflicts_total";

/// Counter: backoff sleeps taken before re-reading.
pub const WRITE_RETRIES_TOTAL: &str = "occupancy_write_retries_total";

/// Counter: writes that ran out of attempts.
pub const WRITES_EXHAUSTED_TOTAL: &str = "occupancy_writes_exhausted_total";

/// Gauge: units currently flagged as hot spots.
pub const HOT_UNITS: &str = "occupancy_hot_units";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: events the gateway refused.
pub const EVENT_PUBLISH_FAILURES_TOTAL: &str = "occupancy_event_publish_failures_total";

/// Counter: expired locks removed by the reaper.
pub const LOCKS_REAPED_TOTAL: &str = "occupancy_locks_reaped_total";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "occupancy_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "occupancy_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "occupancy_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "occupancy_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (entries per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "occupancy_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::Take { .. } => "take",
        Command::Pause { .. } => "pause",
        Command::Complete { .. } => "complete",
        Command::Abandon { .. } => "abandon",
        Command::Heartbeat { .. } => "heartbeat",
        Command::TakeBatch { .. } => "take_batch",
        Command::PauseBatch { .. } => "pause_batch",
        Command::CompleteBatch { .. } => "complete_batch",
        Command::RegisterUnit { .. } => "register_unit",
        Command::GetUnit { .. } => "get_unit",
        Command::HotSpots => "hot_spots",
        Command::Stats => "stats",
        Command::Listen { .. } => "listen",
        Command::Unlisten => "unlisten",
    }
}
