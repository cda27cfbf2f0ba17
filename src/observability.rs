use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking validations. Labels: outcome.
pub const VALIDATIONS_TOTAL: &str = "slotguard_validations_total";

/// Histogram: validation latency in seconds.
pub const VALIDATION_DURATION_SECONDS: &str = "slotguard_validation_duration_seconds";

/// Counter: external availability checks. Labels: outcome.
pub const EXTERNAL_CHECKS_TOTAL: &str = "slotguard_external_checks_total";

/// Counter: ledger writes. Labels: op.
pub const LEDGER_WRITES_TOTAL: &str = "slotguard_ledger_writes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

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
