use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, SnapshotOutcome};
use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::MemoryStore;

/// Background task that rebuilds the current month's snapshot every `every`.
/// The once-per-day guard makes most ticks no-ops.
pub async fn run_snapshot_scheduler(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        snapshot_tick(&engine).await;
    }
}

pub async fn snapshot_tick(engine: &Engine) -> Option<SnapshotOutcome> {
    let month = engine.current_month();
    match engine.build_monthly_snapshot(month).await {
        Ok(outcome) => {
            match &outcome {
                SnapshotOutcome::Built { path, doc_count, .. } => {
                    info!("scheduled snapshot {month}: {doc_count} docs at {path}")
                }
                SnapshotOutcome::AlreadyBuiltToday { .. } => debug!("scheduled snapshot {month}: already built today"),
            }
            Some(outcome)
        }
        Err(e) => {
            warn!("scheduled snapshot {month} failed: {e}");
            None
        }
    }
}

/// Background task that compacts the WAL once it has grown past `threshold` appends.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_tick(&store, threshold).await;
    }
}

pub async fn compact_tick(store: &MemoryStore, threshold: u64) -> bool {
    match store.compact_if_needed(threshold).await {
        Ok(true) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL (threshold {threshold})");
            true
        }
        Ok(false) => false,
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
