use std::net::SocketAddr;

// ── Engine metrics ───────────────────────────────────────

/// Counter: write plans produced. Labels: operation, outcome (ok | conflict).
pub const PLANS_TOTAL: &str = "roomslot_plans_total";

/// Counter: chunks committed.
pub const CHUNK_COMMITS_TOTAL: &str = "roomslot_chunk_commits_total";

/// Counter: chunks given up on (non-transient error or retries exhausted).
pub const CHUNK_FAILURES_TOTAL: &str = "roomslot_chunk_failures_total";

/// Counter: chunk commit retries after a transient store error.
pub const CHUNK_RETRIES_TOTAL: &str = "roomslot_chunk_retries_total";

/// Histogram: latency of a single chunk commit attempt in seconds.
pub const CHUNK_COMMIT_DURATION_SECONDS: &str = "roomslot_chunk_commit_duration_seconds";

/// Counter: snapshot build attempts. Labels: outcome.
pub const SNAPSHOT_BUILDS_TOTAL: &str = "roomslot_snapshot_builds_total";

/// Counter: booking workflow results. Labels: outcome (booked | conflicted).
pub const BOOKINGS_TOTAL: &str = "roomslot_bookings_total";

// ── Storage metrics ──────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomslot_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "roomslot_wal_compactions_total";

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
